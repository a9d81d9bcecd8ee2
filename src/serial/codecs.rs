/// The line coding structure sent with SET_LINE_CODING and read with GET_LINE_CODING.
pub mod line_coding;
