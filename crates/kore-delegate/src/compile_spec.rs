//! Compile-time options handed to a backend alongside its segment.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{DelegateError, Result};

/// An opaque key/value option attached to a delegate call site.
///
/// Specs are passed to the backend unmodified; only the backend decides
/// what a key means.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileSpec {
    pub key: String,
    pub value: Vec<u8>,
}

impl CompileSpec {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    fn value_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.value).map_err(|_| {
            DelegateError::invalid(format!("compile spec '{}' is not valid UTF-8", self.key))
        })
    }
}

/// Numeric precision a backend computes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
        }
    }
}

/// Backend options resolved from a list of [`CompileSpec`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub precision: Precision,
    pub device: String,
    pub profiling: bool,
    /// `None` lets the backend choose.
    pub num_threads: Option<usize>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            precision: Precision::Fp32,
            device: "cpu".to_string(),
            profiling: false,
            num_threads: None,
        }
    }
}

impl BackendConfig {
    /// Resolve recognized keys; later specs override earlier ones.
    pub fn from_specs(specs: &[CompileSpec]) -> Result<Self> {
        let mut config = Self::default();
        for spec in specs {
            match spec.key.as_str() {
                "precision" => {
                    config.precision = match spec.value_str()? {
                        "fp32" => Precision::Fp32,
                        "fp16" => Precision::Fp16,
                        other => {
                            return Err(DelegateError::unsupported(format!(
                                "precision '{}'",
                                other
                            )))
                        }
                    };
                }
                "device" => config.device = spec.value_str()?.to_string(),
                "profiling" => {
                    config.profiling = match spec.value_str()? {
                        "on" => true,
                        "off" => false,
                        other => {
                            return Err(DelegateError::invalid(format!(
                                "profiling must be 'on' or 'off', got '{}'",
                                other
                            )))
                        }
                    };
                }
                "num_threads" => {
                    let raw = spec.value_str()?;
                    let n = raw.trim().parse::<usize>().map_err(|_| {
                        DelegateError::invalid(format!("num_threads '{}' is not a number", raw))
                    })?;
                    config.num_threads = Some(n);
                }
                other => debug!(key = other, "ignoring unrecognized compile spec"),
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_specs() {
        assert_eq!(BackendConfig::from_specs(&[]).unwrap(), BackendConfig::default());
    }

    #[test]
    fn test_resolves_known_keys() {
        let specs = [
            CompileSpec::new("precision", "fp16"),
            CompileSpec::new("device", "cpu"),
            CompileSpec::new("profiling", "on"),
            CompileSpec::new("num_threads", "4"),
            CompileSpec::new("vendor.tuning", vec![0xff, 0x00]),
        ];
        let cfg = BackendConfig::from_specs(&specs).unwrap();
        assert_eq!(cfg.precision, Precision::Fp16);
        assert!(cfg.profiling);
        assert_eq!(cfg.num_threads, Some(4));
    }

    #[test]
    fn test_unknown_precision_not_supported() {
        let err = BackendConfig::from_specs(&[CompileSpec::new("precision", "int4")]).unwrap_err();
        assert!(matches!(err, DelegateError::NotSupported(_)));
    }

    #[test]
    fn test_bad_values_invalid() {
        let err = BackendConfig::from_specs(&[CompileSpec::new("num_threads", "many")]).unwrap_err();
        assert!(matches!(err, DelegateError::InvalidArgument(_)));
        let err = BackendConfig::from_specs(&[CompileSpec::new("device", vec![0xc3, 0x28])]).unwrap_err();
        assert!(matches!(err, DelegateError::InvalidArgument(_)));
    }
}
