use std::env;
use std::path::PathBuf;

use crate::access::PciAccess;
use crate::filter::PciFilter;
use crate::session::{PciSession, ResolveOptions, DEFAULT_SYSFS_ROOT};
use crate::sysfs::SysfsPciAccess;
use crate::{PciDevError, Result};

/// Environment variable overriding [`PciDevConfig::sysfs_root`].
pub const ENV_SYSFS_ROOT: &str = "PCIDEV_SYSFS_ROOT";
/// Environment variable naming a `pci.ids` file.
pub const ENV_PCI_IDS: &str = "PCIDEV_PCI_IDS";
/// Environment variable holding a default location filter (`bb:dd.f`).
pub const ENV_PCI: &str = "PCIDEV_PCI";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevConfig {
    pub sysfs_root: PathBuf,
    /// Name database; `None` searches the usual distribution locations.
    pub pci_ids: Option<PathBuf>,
    pub filter: Option<PciFilter>,
}

impl Default for PciDevConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            pci_ids: None,
            filter: None,
        }
    }
}

impl PciDevConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |var: &str| {
            lookup(var).and_then(|v| {
                let v = v.trim().to_string();
                (!v.is_empty()).then_some(v)
            })
        };

        let mut config = Self::default();
        if let Some(root) = non_empty(ENV_SYSFS_ROOT) {
            config.sysfs_root = PathBuf::from(root);
        }
        config.pci_ids = non_empty(ENV_PCI_IDS).map(PathBuf::from);
        config.filter = non_empty(ENV_PCI)
            .map(|slot| PciFilter::parse_slot(&slot))
            .transpose()?;
        Ok(config)
    }

    /// Defaults overridden by a `key=value,key=value` programmer parameter string.
    ///
    /// Returns the parameters this crate does not consume, in order.
    pub fn from_programmer_params(params: &str) -> Result<(Self, Vec<(String, String)>)> {
        let mut config = Self::default();
        let rest = config.apply_programmer_params(params)?;
        Ok((config, rest))
    }

    /// Applies the `pci=` parameter from `params` on top of `self`.
    ///
    /// A repeated `pci` key, a parameter without `=` or one with an empty value is rejected.
    pub fn apply_programmer_params(&mut self, params: &str) -> Result<Vec<(String, String)>> {
        let mut rest = Vec::new();
        let mut seen_pci = false;

        for param in params.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = param.split_once('=') else {
                return Err(PciDevError::InvalidParam(format!("missing '=' in '{param}'")));
            };
            let (key, value) = (key.trim(), value.trim());
            if value.is_empty() {
                return Err(PciDevError::InvalidParam(format!("missing value for '{key}'")));
            }

            if key == "pci" {
                if seen_pci {
                    return Err(PciDevError::InvalidParam(
                        "parameter 'pci' specified more than once".to_string(),
                    ));
                }
                seen_pci = true;
                self.filter = Some(PciFilter::parse_slot(value)?);
            } else {
                rest.push((key.to_string(), value.to_string()));
            }
        }

        Ok(rest)
    }

    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            filter: self.filter,
            bar: None,
        }
    }

    /// Scans the configured sysfs tree.
    pub fn open_access(&self) -> Result<SysfsPciAccess> {
        let access = SysfsPciAccess::scan(&self.sysfs_root)?;
        match &self.pci_ids {
            Some(path) => access.with_pci_ids(path),
            None => Ok(access),
        }
    }

    pub fn session<A: PciAccess>(&self) -> PciSession<A> {
        PciSession::with_sysfs_root(&self.sysfs_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn env_defaults() {
        let config = PciDevConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PciDevConfig::default());
        assert_eq!(config.sysfs_root, PathBuf::from("/sys/bus/pci/devices"));
    }

    #[test]
    fn env_overrides() {
        let config = PciDevConfig::from_lookup(lookup(&[
            (ENV_SYSFS_ROOT, "/tmp/fake-sysfs"),
            (ENV_PCI_IDS, " /tmp/pci.ids "),
            (ENV_PCI, "00:1f.2"),
        ]))
        .unwrap();
        assert_eq!(config.sysfs_root, PathBuf::from("/tmp/fake-sysfs"));
        assert_eq!(config.pci_ids, Some(PathBuf::from("/tmp/pci.ids")));
        assert_eq!(config.filter, Some(PciFilter::parse_slot("00:1f.2").unwrap()));
    }

    #[test]
    fn env_blank_values_are_ignored() {
        let config = PciDevConfig::from_lookup(lookup(&[(ENV_SYSFS_ROOT, "  "), (ENV_PCI, "")]))
            .unwrap();
        assert_eq!(config, PciDevConfig::default());
    }

    #[test]
    fn env_bad_filter_is_rejected() {
        let err = PciDevConfig::from_lookup(lookup(&[(ENV_PCI, "zz:1f.2")])).unwrap_err();
        assert!(matches!(err, PciDevError::InvalidFilter(_)));
    }

    #[test]
    fn programmer_params_extract_pci() {
        let (config, rest) =
            PciDevConfig::from_programmer_params("spispeed=1M, pci=03:00.0 ,type=nor").unwrap();
        assert_eq!(config.filter, Some(PciFilter::parse_slot("03:00.0").unwrap()));
        assert_eq!(
            rest,
            vec![
                ("spispeed".to_string(), "1M".to_string()),
                ("type".to_string(), "nor".to_string()),
            ]
        );
    }

    #[test]
    fn programmer_params_errors() {
        assert!(matches!(
            PciDevConfig::from_programmer_params("pci=00:01.0,pci=00:02.0"),
            Err(PciDevError::InvalidParam(_))
        ));
        assert!(matches!(
            PciDevConfig::from_programmer_params("pci="),
            Err(PciDevError::InvalidParam(_))
        ));
        assert!(matches!(
            PciDevConfig::from_programmer_params("pci"),
            Err(PciDevError::InvalidParam(_))
        ));
        assert!(matches!(
            PciDevConfig::from_programmer_params("pci=1g:00.0"),
            Err(PciDevError::InvalidFilter(_))
        ));
    }

    #[test]
    fn params_override_env_filter() {
        let mut config = PciDevConfig::from_lookup(lookup(&[(ENV_PCI, "00:1f.2")])).unwrap();
        config.apply_programmer_params("pci=03:00.0").unwrap();
        assert_eq!(config.filter, Some(PciFilter::parse_slot("03:00.0").unwrap()));
        assert_eq!(config.resolve_options().filter, config.filter);
    }
}
