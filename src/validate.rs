use std::fmt;

use itertools::Itertools;
use serde_derive::Serialize;

use crate::resolve::{ResolvedGroup, ResolvedToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A validation finding. Findings are collected and reported, never thrown,
/// so a single pass surfaces every independent problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Declaration label of the group the finding applies to
    pub group: String,
    pub message: String,
}

impl Diagnostic {
    fn error(group: &str, message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            severity: Severity::Error,
            group: group.to_owned(),
            message: message.into(),
        }
    }

    fn warning(group: &str, message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            severity: Severity::Warning,
            group: group.to_owned(),
            message: message.into(),
        }
    }
}

type Rule = fn(&ResolvedGroup) -> Option<Diagnostic>;

/// Independent predicate rules evaluated over every resolved group
const RULES: &[Rule] = &[
    key_pair_without_machine_option,
    key_pair_mismatch,
    spot_without_price,
    spot_price_without_request,
    token_unresolved,
    off_peak_exceeds_idle,
];

fn key_pair_without_machine_option(group: &ResolvedGroup) -> Option<Diagnostic> {
    (group.key_pair.is_some() && group.machine.keypair_name.is_none()).then(|| {
        Diagnostic::error(
            &group.label,
            "key pair configured without matching machine option",
        )
    })
}

fn key_pair_mismatch(group: &ResolvedGroup) -> Option<Diagnostic> {
    match (&group.key_pair, &group.machine.keypair_name) {
        (Some(key_pair), Some(keypair_name)) if key_pair != keypair_name => {
            Some(Diagnostic::warning(
                &group.label,
                format!(
                    "key pair {} does not match machine keypair option {}",
                    key_pair, keypair_name
                ),
            ))
        }
        _ => None,
    }
}

fn spot_without_price(group: &ResolvedGroup) -> Option<Diagnostic> {
    match &group.machine.spot {
        Some(spot) if spot.enabled && spot.price.is_none() => Some(Diagnostic::error(
            &group.label,
            "spot instances requested without a spot price",
        )),
        _ => None,
    }
}

fn spot_price_without_request(group: &ResolvedGroup) -> Option<Diagnostic> {
    match &group.machine.spot {
        Some(spot) if !spot.enabled && spot.price.is_some() => Some(Diagnostic::warning(
            &group.label,
            "spot price is set but spot instances are not requested",
        )),
        _ => None,
    }
}

fn token_unresolved(group: &ResolvedGroup) -> Option<Diagnostic> {
    match &group.token {
        ResolvedToken::Missing => Some(Diagnostic::error(
            &group.label,
            "no token source resolved to a value",
        )),
        ResolvedToken::Conflicting => Some(Diagnostic::error(
            &group.label,
            "both a literal token and a secret parameter are declared",
        )),
        _ => None,
    }
}

fn off_peak_exceeds_idle(group: &ResolvedGroup) -> Option<Diagnostic> {
    (group.off_peak.idle_count > group.idle.count).then(|| {
        Diagnostic::warning(
            &group.label,
            format!(
                "off-peak idle count {} exceeds the regular idle count {}",
                group.off_peak.idle_count, group.idle.count
            ),
        )
    })
}

// group names must be unique within the deployment scope
fn duplicate_names(groups: &[ResolvedGroup]) -> Vec<Diagnostic> {
    let duplicates: Vec<&str> = groups
        .iter()
        .map(|group| group.name.as_str())
        .duplicates()
        .collect();
    groups
        .iter()
        .filter(|group| duplicates.contains(&group.name.as_str()))
        .map(|group| {
            Diagnostic::error(
                &group.label,
                format!(
                    "group name {} is not unique within the deployment",
                    group.name
                ),
            )
        })
        .collect()
}

pub fn validate_group(group: &ResolvedGroup) -> Vec<Diagnostic> {
    RULES.iter().filter_map(|rule| rule(group)).collect()
}

pub fn validate(groups: &[ResolvedGroup]) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = groups.iter().flat_map(validate_group).collect();
    diagnostics.extend(duplicate_names(groups));
    diagnostics
}

pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics
        .iter()
        .any(|diagnostic| diagnostic.severity == Severity::Error)
}

pub fn error_count(diagnostics: &[Diagnostic]) -> usize {
    diagnostics
        .iter()
        .filter(|diagnostic| diagnostic.severity == Severity::Error)
        .count()
}
