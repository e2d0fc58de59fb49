//! Filter profile synthesis.
//!
//! Synthesis is a pure function of the usage set, the options and the
//! previous version number: the allow-list is `baseline ∪ usage`, sorted by
//! name, under a restrictive default action.

use syswarden_common::config::SynthesisConfig;
use syswarden_common::error::{Result, SyswardenError};
use syswarden_common::types::Provenance;

use crate::baseline;
use crate::filter::{DefaultAction, FilterProfile, FilterRule};
use crate::usage::SyscallUsageSet;

/// Synthesis options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisOptions {
    /// Action for syscalls outside the allow-list.
    pub default_action: DefaultAction,
    /// Target architectures, in libseccomp spelling.
    pub architectures: Vec<String>,
    /// Observed syscalls required before the set counts as complete.
    pub min_observed: usize,
    /// Freeze undersized sets anyway, with a warning.
    pub allow_incomplete: bool,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            default_action: DefaultAction::KillProcess,
            architectures: SynthesisConfig::default().architectures,
            min_observed: 1,
            allow_incomplete: false,
        }
    }
}

impl TryFrom<&SynthesisConfig> for SynthesisOptions {
    type Error = SyswardenError;

    fn try_from(config: &SynthesisConfig) -> Result<Self> {
        Ok(Self {
            default_action: DefaultAction::from_config(&config.default_action, config.errno_ret)?,
            architectures: config.architectures.clone(),
            min_observed: config.min_observed_syscalls,
            allow_incomplete: false,
        })
    }
}

/// Builds filter profiles from usage sets.
#[derive(Debug, Clone, Default)]
pub struct Synthesizer {
    options: SynthesisOptions,
}

impl Synthesizer {
    /// Creates a synthesizer with the given options.
    #[must_use]
    pub const fn new(options: SynthesisOptions) -> Self {
        Self { options }
    }

    /// Options in effect.
    #[must_use]
    pub const fn options(&self) -> &SynthesisOptions {
        &self.options
    }

    /// Synthesizes a profile from `usage`.
    ///
    /// The version is `previous.version() + 1`, or 1 without a previous
    /// profile.
    ///
    /// # Errors
    ///
    /// Returns `ProfileGenerationIncomplete` when fewer than `min_observed`
    /// syscalls were observed and `allow_incomplete` is not set, or `Config`
    /// for invalid architectures.
    pub fn synthesize(
        &self,
        usage: &SyscallUsageSet,
        previous: Option<&FilterProfile>,
    ) -> Result<FilterProfile> {
        let observed = usage.observed_count();
        if observed < self.options.min_observed {
            if !self.options.allow_incomplete {
                return Err(SyswardenError::ProfileGenerationIncomplete {
                    observed,
                    minimum: self.options.min_observed,
                });
            }
            tracing::warn!(
                observed,
                minimum = self.options.min_observed,
                "freezing undersized usage set on explicit confirmation"
            );
        }

        let baseline_rules = baseline::baseline().into_iter().map(|syscall| FilterRule {
            syscall,
            provenance: Provenance::Baseline,
        });
        let usage_rules = usage.iter().map(|(syscall, provenance)| FilterRule {
            syscall: syscall.clone(),
            provenance,
        });
        let version = previous.map_or(1, |p| p.version().saturating_add(1));
        let profile = FilterProfile::new(
            self.options.default_action,
            self.options.architectures.clone(),
            baseline_rules.chain(usage_rules),
            version,
        )?;

        tracing::info!(
            version,
            rules = profile.rules().len(),
            observed,
            default_action = %profile.default_action(),
            "synthesized filter profile"
        );
        Ok(profile)
    }
}

/// Synthesizes with default options.
///
/// # Errors
///
/// See [`Synthesizer::synthesize`].
pub fn synthesize(usage: &SyscallUsageSet) -> Result<FilterProfile> {
    Synthesizer::default().synthesize(usage, None)
}

#[cfg(test)]
mod tests {
    use syswarden_common::types::SyscallName;

    use super::*;

    fn observed(names: &[&str]) -> SyscallUsageSet {
        names
            .iter()
            .map(|n| (SyscallName::new(*n).unwrap(), Provenance::Observed))
            .collect()
    }

    #[test]
    fn baseline_is_always_included() {
        let p = synthesize(&observed(&["accept"])).unwrap();
        for name in baseline::baseline() {
            assert!(p.allows(&name), "{name}");
        }
        let accept = p
            .rules()
            .iter()
            .find(|r| r.syscall.as_str() == "accept")
            .unwrap();
        assert_eq!(accept.provenance, Provenance::Observed);
    }

    #[test]
    fn observed_baseline_syscall_keeps_observed_tag() {
        let p = synthesize(&observed(&["read"])).unwrap();
        let read = p.rules().iter().find(|r| r.syscall.as_str() == "read").unwrap();
        assert_eq!(read.provenance, Provenance::Observed);
    }

    #[test]
    fn synthesis_is_monotonic() {
        let small = observed(&["accept", "sendto"]);
        let mut large = small.clone();
        let _ = large.absorb(&observed(&["recvfrom", "epoll_wait"]));

        let a = synthesize(&small).unwrap().allowlist();
        let b = synthesize(&large).unwrap().allowlist();
        assert!(a.is_subset(&b));
    }

    #[test]
    fn synthesis_is_deterministic() {
        let usage = observed(&["write", "accept", "close"]);
        let a = synthesize(&usage).unwrap().to_json().unwrap();
        let b = synthesize(&usage).unwrap().to_json().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_usage_needs_confirmation() {
        let err = synthesize(&SyscallUsageSet::with_baseline()).unwrap_err();
        assert!(matches!(
            err,
            SyswardenError::ProfileGenerationIncomplete {
                observed: 0,
                minimum: 1
            }
        ));

        let confirmed = Synthesizer::new(SynthesisOptions {
            allow_incomplete: true,
            ..SynthesisOptions::default()
        });
        let p = confirmed.synthesize(&SyscallUsageSet::new(), None).unwrap();
        assert_eq!(p.rules().len(), baseline::BASELINE.len());
    }

    #[test]
    fn version_follows_previous() {
        let s = Synthesizer::default();
        let v1 = s.synthesize(&observed(&["accept"]), None).unwrap();
        let v2 = s.synthesize(&observed(&["accept"]), Some(&v1)).unwrap();
        assert_eq!(v1.version(), 1);
        assert_eq!(v2.version(), 2);
    }

    #[test]
    fn options_from_config() {
        let config = SynthesisConfig {
            default_action: "errno".into(),
            errno_ret: 1,
            ..SynthesisConfig::default()
        };
        let opts = SynthesisOptions::try_from(&config).unwrap();
        assert_eq!(opts.default_action, DefaultAction::Errno(1));

        let bad = SynthesisConfig {
            default_action: "allow".into(),
            ..SynthesisConfig::default()
        };
        assert!(SynthesisOptions::try_from(&bad).is_err());
    }
}
