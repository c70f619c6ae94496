use crate::config::{FilterConfig, FilterMode};
use crate::error::{Error, Result};
use log::warn;
use regex_lite::Regex;
use std::collections::HashSet;

const FIRST_APPLICATION_UID: u32 = 10000;
const FIRST_ISOLATED_UID: u32 = 90000;
const LAST_ISOLATED_UID: u32 = 99999;
const PER_USER_RANGE: u32 = 100000;

/// Identity of the process being specialized. Fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub package_name: String,
    pub process_name: String,
    pub uid: u32,
    pub is_child_zygote: bool,
}

impl TargetDescriptor {
    /// Derives the package from the process name (`com.app:remote` runs
    /// `com.app`), falling back to the basename of the app data dir.
    pub fn new(process_name: &str, app_data_dir: Option<&str>, uid: u32) -> Self {
        let from_process = process_name.split(':').next().unwrap_or_default().trim();

        let package_name = if !from_process.is_empty() {
            from_process.to_string()
        } else {
            app_data_dir
                .and_then(|dir| dir.trim_end_matches('/').rsplit('/').next())
                .unwrap_or_default()
                .to_string()
        };

        Self {
            package_name,
            process_name: process_name.to_string(),
            uid,
            is_child_zygote: false,
        }
    }

    pub fn child_zygote(mut self, is_child_zygote: bool) -> Self {
        self.is_child_zygote = is_child_zygote;
        self
    }

    pub fn app_id(&self) -> u32 {
        self.uid % PER_USER_RANGE
    }

    pub fn is_isolated(&self) -> bool {
        (FIRST_ISOLATED_UID..=LAST_ISOLATED_UID).contains(&self.app_id())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Decision {
    Intercept,
    Ignore,
}

#[derive(Debug)]
pub struct TargetFilter {
    mode: FilterMode,
    packages: HashSet<String>,
    patterns: Vec<Regex>,
    skip_isolated: bool,
    fail_safe: bool,
}

impl TargetFilter {
    pub fn new(config: &FilterConfig) -> Result<Self> {
        let patterns = config
            .patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .map_err(|err| Error::configuration(format!("bad pattern {pattern:?}: {err}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            mode: config.mode,
            packages: config.packages.iter().cloned().collect(),
            patterns,
            skip_isolated: config.skip_isolated,
            fail_safe: false,
        })
    }

    pub fn allowlist<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: FilterMode::Allowlist,
            packages: packages.into_iter().map(Into::into).collect(),
            patterns: Vec::new(),
            skip_isolated: true,
            fail_safe: false,
        }
    }

    /// Ignores everything; used whenever the configuration cannot be read.
    pub fn fail_safe() -> Self {
        Self {
            mode: FilterMode::Allowlist,
            packages: HashSet::new(),
            patterns: Vec::new(),
            skip_isolated: true,
            fail_safe: true,
        }
    }

    pub fn from_config(config: Result<&FilterConfig>) -> Self {
        match config.and_then(Self::new) {
            Ok(filter) => filter,
            Err(err) => {
                warn!("filter configuration unusable, ignoring all processes: {err}");
                Self::fail_safe()
            }
        }
    }

    pub fn evaluate(&self, target: &TargetDescriptor) -> Decision {
        if self.fail_safe
            || target.package_name.is_empty()
            || target.is_child_zygote
            || target.app_id() < FIRST_APPLICATION_UID
            || (self.skip_isolated && target.is_isolated())
        {
            return Decision::Ignore;
        }

        let matched = match self.mode {
            FilterMode::All => true,
            FilterMode::Allowlist => {
                self.packages.contains(&target.package_name)
                    || self
                        .patterns
                        .iter()
                        .any(|pattern| pattern.is_match(&target.package_name))
            }
        };

        if matched {
            Decision::Intercept
        } else {
            Decision::Ignore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str) -> TargetDescriptor {
        TargetDescriptor::new(name, None, 10123)
    }

    #[test]
    fn allowlist_scenario() {
        let filter = TargetFilter::allowlist(["com.example.maps"]);

        assert_eq!(filter.evaluate(&app("com.example.maps")), Decision::Intercept);
        assert_eq!(filter.evaluate(&app("com.other.app")), Decision::Ignore);
    }

    #[test]
    fn secondary_processes_share_the_package() {
        let filter = TargetFilter::allowlist(["com.example.maps"]);
        let target = app("com.example.maps:location");

        assert_eq!(target.package_name, "com.example.maps");
        assert_eq!(filter.evaluate(&target), Decision::Intercept);
    }

    #[test]
    fn falls_back_to_data_dir() {
        let target = TargetDescriptor::new("", Some("/data/user/0/com.example.maps/"), 10123);
        assert_eq!(target.package_name, "com.example.maps");
    }

    #[test]
    fn intercept_all_still_skips_system_and_isolated() {
        let filter = TargetFilter::new(&FilterConfig {
            mode: FilterMode::All,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(filter.evaluate(&app("com.any.app")), Decision::Intercept);
        assert_eq!(
            filter.evaluate(&TargetDescriptor::new("com.android.phone", None, 1001)),
            Decision::Ignore
        );
        assert_eq!(
            filter.evaluate(&TargetDescriptor::new("com.any.app:sandboxed", None, 1_090_001)),
            Decision::Ignore
        );
        assert_eq!(
            filter.evaluate(&app("com.any.app").child_zygote(true)),
            Decision::Ignore
        );
    }

    #[test]
    fn secondary_user_uids_are_applications() {
        let filter = TargetFilter::allowlist(["com.example.maps"]);
        let target = TargetDescriptor::new("com.example.maps", None, 1_010_123);

        assert_eq!(target.app_id(), 10123);
        assert_eq!(filter.evaluate(&target), Decision::Intercept);
    }

    #[test]
    fn patterns_extend_the_allowlist() {
        let filter = TargetFilter::new(&FilterConfig {
            patterns: vec![r"^com\.example\.".into()],
            ..Default::default()
        })
        .unwrap();

        assert_eq!(filter.evaluate(&app("com.example.nav")), Decision::Intercept);
        assert_eq!(filter.evaluate(&app("org.example.nav")), Decision::Ignore);
    }

    #[test]
    fn unusable_configuration_ignores_everything() {
        let bad = FilterConfig {
            mode: FilterMode::All,
            patterns: vec!["(".into()],
            ..Default::default()
        };
        let filter = TargetFilter::from_config(Ok(&bad));
        assert_eq!(filter.evaluate(&app("com.example.maps")), Decision::Ignore);

        let filter = TargetFilter::from_config(Err(Error::configuration("unreadable")));
        assert_eq!(filter.evaluate(&app("com.example.maps")), Decision::Ignore);
    }
}
