use anyhow::{anyhow, bail};
use itertools::Itertools;
use serde_derive::Serialize;

use crate::config::DeploymentContext;
use crate::identity::IdentityBinding;
use crate::manager_config::{self, ManagerConfig, MANAGER_CONFIG_PATH};
use crate::resolve::{MachineImage, ResolvedGroup, ResolvedToken};
use crate::validate::{self, Severity};

/// Fixed location of the hook that re-runs the bootstrap sequence whenever
/// the configuration document changes
pub const RELOAD_HOOK_PATH: &str = "/etc/gitlab-runner/hooks.d/config-reload.conf";

const BOOTSTRAP_LOG_PATH: &str = "/var/log/runner-bootstrap.log";

/// Packages installed on the manager before the runner agent starts
const PACKAGES: [&str; 3] = ["docker", "gitlab-runner", "tzdata"];

/// Services enabled once the configuration is in place
const SERVICES: [&str; 3] = ["docker", "gitlab-runner", "awslogsd"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

/// Installation and service-activation sequence for the manager instance
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDirectives {
    pub packages: Vec<String>,
    pub files: Vec<GeneratedFile>,
    pub commands: Vec<String>,
    pub services: Vec<String>,
}

impl ServiceDirectives {
    /// Render the directives as a user-data script run by the manager at boot
    pub fn to_user_data(&self) -> String {
        let mut script = String::new();
        script.push_str("#!/bin/bash\n");
        script.push_str("set -euo pipefail\n\n");
        script.push_str(&format!("exec > >(tee {}) 2>&1\n\n", BOOTSTRAP_LOG_PATH));
        script.push_str(&format!("yum install -y {}\n\n", self.packages.iter().join(" ")));
        for file in &self.files {
            script.push_str(&format!("mkdir -p \"$(dirname {})\"\n", file.path));
            script.push_str(&format!(
                "cat > {} <<'FLEET_EOF'\n{}FLEET_EOF\n\n",
                file.path,
                with_trailing_newline(&file.content)
            ));
        }
        for command in &self.commands {
            script.push_str(command);
            script.push('\n');
        }
        if !self.commands.is_empty() {
            script.push('\n');
        }
        for service in &self.services {
            script.push_str(&format!("systemctl enable --now {}\n", service));
        }
        script
    }
}

fn with_trailing_newline(content: &str) -> String {
    if content.ends_with('\n') {
        content.to_owned()
    } else {
        format!("{}\n", content)
    }
}

/// Lifecycle directive for a group's cache bucket. A zero day count disables
/// expiry entirely instead of enabling the rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheLifecycle {
    pub bucket: String,
    pub expire_after_days: Option<u32>,
}

impl CacheLifecycle {
    pub fn from_days(bucket: &str, days: u32) -> CacheLifecycle {
        CacheLifecycle {
            bucket: bucket.to_owned(),
            expire_after_days: (days > 0).then_some(days),
        }
    }
}

/// Everything the provisioning collaborator needs beyond the configuration
/// document itself. Identifier strings only, never inspected resource state
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionSpec {
    pub stack: String,
    pub region: String,
    pub groups: Vec<GroupProvision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupProvision {
    pub name: String,
    pub subnet_id: String,
    pub security_group: String,
    pub key_pair: Option<String>,
    pub image: MachineImage,
    pub cache: CacheLifecycle,
    pub identity: IdentityBinding,
}

#[derive(Debug, Clone)]
pub struct BootstrapArtifacts {
    /// The runner-manager configuration document
    pub manager_config: String,
    /// Hook file that re-triggers bootstrap on document changes
    pub reload_hook: String,
    /// Structured install/activation sequence
    pub directives: ServiceDirectives,
    /// The directives rendered as a boot script
    pub user_data: String,
    /// Companion document for the provisioning collaborator
    pub provision: ProvisionSpec,
}

/// Generate all bootstrap artifacts for the given groups. Refuses to produce
/// any output when an error-severity diagnostic exists for the input
pub fn generate(
    deployment: &DeploymentContext,
    concurrent: u32,
    check_interval: u32,
    groups: &[(ResolvedGroup, IdentityBinding)],
) -> anyhow::Result<BootstrapArtifacts> {
    let resolved: Vec<ResolvedGroup> = groups.iter().map(|(group, _)| group.clone()).collect();
    let diagnostics = validate::validate(&resolved);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|diagnostic| diagnostic.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        bail!(
            "refusing to generate artifacts: {}",
            errors
                .iter()
                .map(|diagnostic| format!("{}: {}", diagnostic.group, diagnostic.message))
                .join("; ")
        );
    }
    let manager_config = ManagerConfig::new(concurrent, check_interval, &resolved).render()?;
    let reload_hook = reload_hook();
    let directives = service_directives(&manager_config, &reload_hook, &resolved)?;
    let user_data = directives.to_user_data();
    let provision = provision_spec(deployment, groups);
    Ok(BootstrapArtifacts {
        manager_config,
        reload_hook,
        directives,
        user_data,
        provision,
    })
}

/// The manager re-runs the bootstrap sequence whenever the document changes
pub fn reload_hook() -> String {
    format!(
        "[runner-config-reload]\n\
         triggers=post.update\n\
         path={}\n\
         action=/usr/bin/gitlab-runner restart\n\
         runas=root\n",
        MANAGER_CONFIG_PATH
    )
}

fn service_directives(
    document: &str,
    hook: &str,
    groups: &[ResolvedGroup],
) -> anyhow::Result<ServiceDirectives> {
    let mut commands = Vec::new();
    for group in groups {
        if let ResolvedToken::SecretParameter(parameter) = &group.token {
            validate_shell_input(parameter, "secret_parameter").map_err(|e| anyhow!(e))?;
            commands.push(secret_fetch_command(group, parameter));
        }
    }
    Ok(ServiceDirectives {
        packages: PACKAGES.iter().map(|p| p.to_string()).collect(),
        files: vec![
            GeneratedFile {
                path: MANAGER_CONFIG_PATH.to_owned(),
                content: document.to_owned(),
            },
            GeneratedFile {
                path: RELOAD_HOOK_PATH.to_owned(),
                content: hook.to_owned(),
            },
        ],
        commands,
        services: SERVICES.iter().map(|s| s.to_string()).collect(),
    })
}

fn secret_fetch_command(group: &ResolvedGroup, parameter: &str) -> String {
    format!(
        "token=$(aws ssm get-parameter --name \"{}\" --with-decryption --query Parameter.Value --output text)\n\
         sed -i \"s|{}|${{token}}|\" {}",
        parameter,
        manager_config::token_placeholder(&group.name),
        MANAGER_CONFIG_PATH
    )
}

/// Reject values that could break out of double-quoted shell strings
fn validate_shell_input(value: &str, field_name: &str) -> Result<(), String> {
    const FORBIDDEN: &[char] = &['"', '\\', '`', '$', '\n', '\r'];
    if let Some(bad) = value.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(format!("{} contains forbidden character: {:?}", field_name, bad));
    }
    if value.is_empty() {
        return Err(format!("{} cannot be empty", field_name));
    }
    Ok(())
}

fn provision_spec(
    deployment: &DeploymentContext,
    groups: &[(ResolvedGroup, IdentityBinding)],
) -> ProvisionSpec {
    ProvisionSpec {
        stack: deployment.stack.clone(),
        region: deployment.region.clone(),
        groups: groups
            .iter()
            .map(|(group, identity)| GroupProvision {
                name: group.name.clone(),
                subnet_id: group.machine.subnet_id.clone(),
                security_group: group.machine.security_group.clone(),
                key_pair: group.key_pair.clone(),
                image: group.machine.image.clone(),
                cache: CacheLifecycle::from_days(&group.cache.bucket, group.cache.expiration_days),
                identity: identity.clone(),
            })
            .collect(),
    }
}
