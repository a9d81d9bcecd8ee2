use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    serial::{DataBitsPolicy, Parity, SerialOptions},
};

/// Signal levels sent while opening a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialSignals {
    /// Data terminal ready.
    pub dtr: bool,

    /// Request to send.
    pub rts: bool,
}

impl Default for InitialSignals {
    fn default() -> Self {
        Self {
            dtr: true,
            rts: false,
        }
    }
}

/// The configuration used for ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Options used when a caller has none of their own, for example the CLI.
    pub default_options: SerialOptions,

    /// Sent with the control line state request issued while opening.
    pub initial_signals: InitialSignals,

    /// Which data bit counts open and reconfigure accept.
    pub data_bits_policy: DataBitsPolicy,

    /// How long a control request may take.
    pub control_timeout_ms: u64,

    /// How long closing waits for transfers to let go after cancelling them.
    pub cancel_timeout_ms: u64,

    /// Read the line coding back after setting it, and fail if it differs.
    pub verify_line_coding: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_options: SerialOptions::default(),
            initial_signals: InitialSignals::default(),
            data_bits_policy: DataBitsPolicy::default(),
            control_timeout_ms: 1000,
            cancel_timeout_ms: 500,
            verify_line_coding: false,
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Could not parse: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            default_options: SerialOptions::new(9600).parity(Parity::Even),
            verify_line_coding: true,
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(format!("Could not serialize: {e}")))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::BadConfig(format!("Could not read {path:?}: {e}")))?;

        let config = Self::deserialize(&s)?;
        config.validate()?;

        Ok(config)
    }

    /// See [`Config::control_timeout_ms`].
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    /// See [`Config::cancel_timeout_ms`].
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    /// Check the configuration makes sense.
    pub fn validate(&self) -> Result<(), Error> {
        if self.control_timeout_ms == 0 {
            return Err(Error::BadConfig(
                "The control timeout must be above zero".into(),
            ));
        }

        if self.cancel_timeout_ms == 0 {
            return Err(Error::BadConfig("The cancel timeout must be above zero".into()));
        }

        self.default_options
            .validate_with(self.data_bits_policy)
            .map_err(|e| Error::BadConfig(format!("Default options: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn serialize() {
        let c = Config::example();

        println!("{}", c.serialize_pretty().unwrap());
    }

    #[test]
    fn example_survives_ron() {
        let c = Config::example();
        let back = Config::deserialize(&c.serialize_pretty().unwrap()).unwrap();

        assert_eq!(c, back);
    }

    #[test]
    fn deserialize() {
        let input = r#"
(
    default_options: (
        baud_rate: 57600,
        parity: odd,
        flow_control: (rtscts: true),
    ),
    initial_signals: (dtr: false, rts: true),
    data_bits_policy: Wire,
    cancel_timeout_ms: 250,
)
"#;
        let config = Config::deserialize(input).unwrap();
        config.validate().unwrap();

        assert_eq!(config.default_options.baud_rate, 57600);
        assert_eq!(config.default_options.parity, Parity::Odd);
        assert_eq!(config.default_options.data_bits, 8);
        assert!(config.default_options.flow_control.rtscts);
        assert_eq!(config.initial_signals, InitialSignals { dtr: false, rts: true });
        assert_eq!(config.data_bits_policy, DataBitsPolicy::Wire);
        assert_eq!(config.control_timeout_ms, 1000);
        assert_eq!(config.cancel_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn empty_is_default() {
        assert_eq!(Config::deserialize("()").unwrap(), Config::default());
    }

    #[test]
    fn bad_parity_is_bad_config() {
        let err = Config::deserialize("(default_options: (parity: xyz))").unwrap_err();

        assert!(err.try_into_bad_config().is_ok());
    }

    #[test]
    fn bad_config_timeouts() {
        let c = Config {
            control_timeout_ms: 0,
            ..Default::default()
        };

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(err.contains("control timeout"));
    }

    #[test]
    fn bad_config_default_options() {
        let c = Config {
            default_options: SerialOptions::new(9600).data_bits(7),
            ..Default::default()
        };

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(err.contains("data_bits"));

        let c = Config {
            data_bits_policy: DataBitsPolicy::Wire,
            ..c
        };
        c.validate().unwrap();
    }
}
