use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::warn;
use rand::{distributions::Alphanumeric, Rng};
use serde_derive::Serialize;

use crate::config::{
    CacheTemplate, DeploymentContext, DockerTemplate, ExecutorKind, FleetConfig, GroupConfig,
    IdleTemplate, MachineTemplate, OffPeakTemplate, SuppliedIdentity, TokenSource,
};

/// Smallest general-purpose instance class, used when no type is declared
pub const DEFAULT_INSTANCE_TYPE: &str = "t3.micro";

const DEFAULT_DOCKER_IMAGE: &str = "docker:24.0";
const DEFAULT_IDLE_COUNT: u32 = 0;
const DEFAULT_IDLE_TIME: u32 = 600;
const DEFAULT_OFF_PEAK_TIMEZONE: &str = "UTC";
const DEFAULT_OFF_PEAK_IDLE_COUNT: u32 = 0;
const DEFAULT_OFF_PEAK_IDLE_TIME: u32 = 300;
const DEFAULT_MAX_BUILDS: u32 = 10;

/// Width of the random name suffix. Collision resistance across concurrent
/// deployments comes from this width, not from coordination
const NAME_SUFFIX_LEN: usize = 8;

/// Search filter for picking a machine image when none is declared
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageFilter {
    pub architecture: String,
    pub virtualization: String,
    pub root_device: String,
    pub state: String,
}

impl Default for ImageFilter {
    fn default() -> Self {
        ImageFilter {
            architecture: "x86_64".into(),
            virtualization: "hvm".into(),
            root_device: "ebs".into(),
            state: "available".into(),
        }
    }
}

/// Catalog entry the image search filter is matched against
#[derive(Debug, Clone)]
pub struct ImageCandidate {
    pub id: String,
    pub architecture: String,
    pub virtualization: String,
    pub root_device: String,
    pub state: String,
    pub creation_date: DateTime<Utc>,
}

impl ImageFilter {
    pub fn matches(&self, candidate: &ImageCandidate) -> bool {
        candidate.architecture == self.architecture
            && candidate.virtualization == self.virtualization
            && candidate.root_device == self.root_device
            && candidate.state == self.state
    }

    /// The most recent match wins when several images satisfy the filter
    pub fn select_latest<'a>(
        &self,
        candidates: &'a [ImageCandidate],
    ) -> Option<&'a ImageCandidate> {
        candidates
            .iter()
            .filter(|candidate| self.matches(candidate))
            .max_by_key(|candidate| candidate.creation_date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineImage {
    /// Concrete image id declared by the user
    Id(String),
    /// Resolved by the provisioning collaborator to the newest match
    Search(ImageFilter),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedToken {
    /// Literal token after environment expansion
    Value(String),
    /// Managed secret parameter fetched on the manager at boot
    SecretParameter(String),
    /// No source resolved to a value, reported by the validator
    Missing,
    /// More than one source was declared, reported by the validator
    Conflicting,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotRequest {
    pub enabled: bool,
    /// Bid price per instance hour, its absence is diagnosed before generation
    pub price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedDocker {
    pub image: String,
    pub privileged: bool,
    pub tls_verify: bool,
    pub volumes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedMachine {
    pub instance_type: String,
    pub region: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub zone: String,
    pub security_group: String,
    pub keypair_name: Option<String>,
    pub image: MachineImage,
    pub spot: Option<SpotRequest>,
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedCache {
    pub bucket: String,
    pub region: String,
    pub shared: bool,
    pub expiration_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdlePolicy {
    pub count: u32,
    pub time: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffPeakPolicy {
    pub timezone: String,
    pub idle_count: u32,
    pub idle_time: u32,
}

/// A runner group with every default filled in. Constructed once per
/// declaration and consumed exactly once by the artifact generator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedGroup {
    pub name: String,
    pub label: String,
    pub gitlab_url: String,
    pub executor: ExecutorKind,
    pub max_builds: u32,
    pub limit: u32,
    pub environment: Vec<String>,
    pub key_pair: Option<String>,
    pub token: ResolvedToken,
    pub docker: ResolvedDocker,
    pub machine: ResolvedMachine,
    pub cache: ResolvedCache,
    pub idle: IdlePolicy,
    pub off_peak: OffPeakPolicy,
    pub identity: Option<SuppliedIdentity>,
}

/// Derive a collision-resistant group name from the deployment scope, the
/// declaration label, a timestamp and a random suffix. Clock and randomness
/// are passed in so resolution stays deterministic under test
pub fn generate_group_name(
    stack: &str,
    label: &str,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> String {
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect::<String>()
        .to_lowercase();
    format!("{}-{}-{}-{}", stack, label, now.format("%Y%m%d%H%M%S"), suffix)
}

pub fn resolve(label: &str, group: &GroupConfig, fleet: &FleetConfig) -> ResolvedGroup {
    resolve_with(label, group, fleet, Utc::now(), &mut rand::thread_rng())
}

/// Fill every optional field of a group declaration. Total: defaulting always
/// succeeds, problems are left to the validator. The input is never mutated
pub fn resolve_with(
    label: &str,
    group: &GroupConfig,
    fleet: &FleetConfig,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> ResolvedGroup {
    let ctx = &fleet.deployment;
    let name = match &group.name {
        Some(name) if !name.is_empty() => name.clone(),
        _ => generate_group_name(&ctx.stack, label, now, rng),
    };
    let cache = resolve_cache(group.cache.as_ref(), &name, ctx);
    ResolvedGroup {
        label: label.to_owned(),
        gitlab_url: fleet.gitlab_url.clone(),
        executor: group.executor.unwrap_or(ExecutorKind::DockerMachine),
        max_builds: group.max_builds.unwrap_or(DEFAULT_MAX_BUILDS),
        limit: group.limit.unwrap_or(0),
        environment: group.environment.clone().unwrap_or_default(),
        key_pair: group.key_pair.clone(),
        token: resolve_token(&group.token),
        docker: resolve_docker(group.docker.as_ref()),
        machine: resolve_machine(group.machine.as_ref(), ctx),
        cache,
        idle: resolve_idle(group.idle.as_ref()),
        off_peak: resolve_off_peak(group.off_peak.as_ref()),
        identity: group.identity.clone(),
        name,
    }
}

fn resolve_token(source: &TokenSource) -> ResolvedToken {
    let value = source.value.as_deref().and_then(expand_token_value);
    let secret = source.secret_parameter.clone().filter(|s| !s.is_empty());
    match (value, secret) {
        (Some(_), Some(_)) => ResolvedToken::Conflicting,
        (Some(value), None) => ResolvedToken::Value(value),
        (None, Some(secret)) => ResolvedToken::SecretParameter(secret),
        (None, None) => ResolvedToken::Missing,
    }
}

fn expand_token_value(raw: &str) -> Option<String> {
    match shellexpand::env(raw) {
        Ok(expanded) if !expanded.is_empty() => Some(expanded.into_owned()),
        Ok(_) => None,
        Err(e) => {
            warn!("Token value could not be expanded: {}", e);
            None
        }
    }
}

fn resolve_docker(template: Option<&DockerTemplate>) -> ResolvedDocker {
    let template = template.cloned().unwrap_or_default();
    ResolvedDocker {
        image: template.image.unwrap_or_else(|| DEFAULT_DOCKER_IMAGE.into()),
        privileged: template.privileged.unwrap_or(true),
        tls_verify: template.tls_verify.unwrap_or(false),
        volumes: template.volumes.unwrap_or_else(|| vec!["/cache".to_owned()]),
    }
}

fn resolve_machine(template: Option<&MachineTemplate>, ctx: &DeploymentContext) -> ResolvedMachine {
    let template = template.cloned().unwrap_or_default();
    ResolvedMachine {
        instance_type: template
            .instance_type
            .unwrap_or_else(|| DEFAULT_INSTANCE_TYPE.into()),
        region: template.region.unwrap_or_else(|| ctx.region.clone()),
        vpc_id: template
            .vpc_id
            .unwrap_or_else(|| format!("{}-vpc", ctx.stack)),
        subnet_id: template
            .subnet_id
            .unwrap_or_else(|| format!("{}-subnet", ctx.stack)),
        zone: template.zone.unwrap_or_else(|| "a".into()),
        security_group: template
            .security_group
            .unwrap_or_else(|| format!("{}-runners", ctx.stack)),
        keypair_name: template.keypair_name,
        image: template
            .image
            .map(MachineImage::Id)
            .unwrap_or_else(|| MachineImage::Search(ImageFilter::default())),
        spot: resolve_spot(template.spot_instances, template.spot_price),
        options: template.options,
    }
}

fn resolve_spot(enabled: Option<bool>, price: Option<f64>) -> Option<SpotRequest> {
    if enabled.is_none() && price.is_none() {
        return None;
    }
    Some(SpotRequest {
        enabled: enabled.unwrap_or(false),
        price,
    })
}

fn resolve_cache(
    template: Option<&CacheTemplate>,
    name: &str,
    ctx: &DeploymentContext,
) -> ResolvedCache {
    let template = template.cloned().unwrap_or_default();
    ResolvedCache {
        bucket: template.bucket.unwrap_or_else(|| format!("{}-cache", name)),
        region: template.region.unwrap_or_else(|| ctx.region.clone()),
        shared: template.shared.unwrap_or(false),
        expiration_days: template.expiration_days.unwrap_or(0),
    }
}

fn resolve_idle(template: Option<&IdleTemplate>) -> IdlePolicy {
    let template = template.cloned().unwrap_or_default();
    IdlePolicy {
        count: template.count.unwrap_or(DEFAULT_IDLE_COUNT),
        time: template.time.unwrap_or(DEFAULT_IDLE_TIME),
    }
}

fn resolve_off_peak(template: Option<&OffPeakTemplate>) -> OffPeakPolicy {
    let template = template.cloned().unwrap_or_default();
    OffPeakPolicy {
        timezone: template
            .timezone
            .unwrap_or_else(|| DEFAULT_OFF_PEAK_TIMEZONE.into()),
        idle_count: template.idle_count.unwrap_or(DEFAULT_OFF_PEAK_IDLE_COUNT),
        idle_time: template.idle_time.unwrap_or(DEFAULT_OFF_PEAK_IDLE_TIME),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::TimeZone;
    use rand::{rngs::StdRng, SeedableRng};

    use crate::config::TokenSource;

    use super::*;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    fn minimal_fleet() -> FleetConfig {
        toml::from_str(
            r#"
            [groups.min]
            [groups.min.token]
            value = "abc"
            "#,
        )
        .unwrap()
    }

    fn full_group() -> GroupConfig {
        let fleet: FleetConfig = toml::from_str(
            r#"
            [groups.full]
            name = "ci-full"
            executor = "docker-machine"
            environment = ["A=1"]
            max_builds = 5
            limit = 2
            [groups.full.token]
            value = "tok"
            [groups.full.docker]
            image = "alpine:3.20"
            privileged = false
            tls_verify = true
            volumes = ["/cache", "/certs"]
            [groups.full.machine]
            instance_type = "m5.large"
            image = "ami-0123456789abcdef0"
            region = "eu-west-1"
            vpc_id = "vpc-1"
            subnet_id = "subnet-1"
            zone = "b"
            security_group = "sg-1"
            spot_instances = false
            [groups.full.cache]
            bucket = "my-cache"
            region = "eu-west-1"
            shared = true
            expiration_days = 7
            [groups.full.idle]
            count = 2
            time = 300
            [groups.full.off_peak]
            timezone = "Europe/Berlin"
            idle_count = 1
            idle_time = 120
            "#,
        )
        .unwrap();
        fleet.groups["full"].clone()
    }

    #[test]
    fn minimal_group_is_fully_populated() {
        let fleet = minimal_fleet();
        let mut rng = StdRng::seed_from_u64(7);
        let resolved = resolve_with("min", &fleet.groups["min"], &fleet, test_time(), &mut rng);
        assert!(!resolved.name.is_empty());
        assert_eq!(resolved.executor, ExecutorKind::DockerMachine);
        assert_eq!(resolved.machine.instance_type, DEFAULT_INSTANCE_TYPE);
        assert_eq!(resolved.machine.region, "us-east-1");
        assert_eq!(resolved.machine.vpc_id, "ci-vpc");
        assert_eq!(resolved.machine.subnet_id, "ci-subnet");
        assert_eq!(resolved.machine.security_group, "ci-runners");
        assert_eq!(
            resolved.machine.image,
            MachineImage::Search(ImageFilter::default())
        );
        assert_eq!(resolved.cache.bucket, format!("{}-cache", resolved.name));
        assert_eq!(resolved.cache.expiration_days, 0);
        assert_eq!(resolved.token, ResolvedToken::Value("abc".into()));
        assert_eq!(resolved.idle.count, DEFAULT_IDLE_COUNT);
        assert_eq!(resolved.idle.time, DEFAULT_IDLE_TIME);
        assert_eq!(resolved.off_peak.timezone, DEFAULT_OFF_PEAK_TIMEZONE);
        assert_eq!(resolved.max_builds, DEFAULT_MAX_BUILDS);
    }

    #[test]
    fn declared_fields_win_over_defaults() {
        let fleet = minimal_fleet();
        let mut rng = StdRng::seed_from_u64(7);
        let resolved = resolve_with("full", &full_group(), &fleet, test_time(), &mut rng);
        assert_eq!(resolved.name, "ci-full");
        assert_eq!(resolved.machine.instance_type, "m5.large");
        assert_eq!(resolved.machine.region, "eu-west-1");
        assert_eq!(
            resolved.machine.image,
            MachineImage::Id("ami-0123456789abcdef0".into())
        );
        assert_eq!(resolved.cache.bucket, "my-cache");
        assert_eq!(resolved.docker.image, "alpine:3.20");
        assert!(!resolved.docker.privileged);
        assert_eq!(resolved.off_peak.timezone, "Europe/Berlin");
    }

    #[test]
    fn resolution_is_idempotent_for_populated_groups() {
        let fleet = minimal_fleet();
        let group = full_group();
        let mut rng_a = StdRng::seed_from_u64(1);
        let mut rng_b = StdRng::seed_from_u64(2);
        let first = resolve_with("full", &group, &fleet, test_time(), &mut rng_a);
        let second = resolve_with(
            "full",
            &group,
            &fleet,
            test_time() + chrono::Duration::hours(3),
            &mut rng_b,
        );
        assert_eq!(first, second);
    }

    #[test]
    fn generated_names_are_distinct() {
        let mut rng = StdRng::seed_from_u64(42);
        let now = test_time();
        let names: HashSet<String> = (0..1000)
            .map(|_| generate_group_name("ci", "g", now, &mut rng))
            .collect();
        assert_eq!(names.len(), 1000);
    }

    #[test]
    fn generated_name_embeds_scope_and_timestamp() {
        let mut rng = StdRng::seed_from_u64(42);
        let name = generate_group_name("ci", "linux", test_time(), &mut rng);
        assert!(name.starts_with("ci-linux-20240501123000-"), "{}", name);
        assert_eq!(name.len(), "ci-linux-20240501123000-".len() + 8);
    }

    #[test]
    fn token_value_expands_environment_variables() {
        std::env::set_var("FLEET_TEST_TOKEN", "sekrit");
        let token = resolve_token(&TokenSource {
            value: Some("$FLEET_TEST_TOKEN".into()),
            secret_parameter: None,
        });
        assert_eq!(token, ResolvedToken::Value("sekrit".into()));
    }

    #[test]
    fn token_conflicts_and_gaps_are_preserved_for_validation() {
        let both = resolve_token(&TokenSource {
            value: Some("tok".into()),
            secret_parameter: Some("/runners/token".into()),
        });
        assert_eq!(both, ResolvedToken::Conflicting);
        let neither = resolve_token(&TokenSource::default());
        assert_eq!(neither, ResolvedToken::Missing);
        let empty = resolve_token(&TokenSource {
            value: Some("".into()),
            secret_parameter: None,
        });
        assert_eq!(empty, ResolvedToken::Missing);
    }

    #[test]
    fn spot_price_is_kept_even_when_spot_is_disabled() {
        let spot = resolve_spot(Some(false), Some(0.2)).unwrap();
        assert!(!spot.enabled);
        assert_eq!(spot.price, Some(0.2));
        assert_eq!(resolve_spot(None, None), None);
    }

    #[test]
    fn newest_matching_image_wins() {
        let filter = ImageFilter::default();
        let candidate = |id: &str, arch: &str, day: u32| ImageCandidate {
            id: id.into(),
            architecture: arch.into(),
            virtualization: "hvm".into(),
            root_device: "ebs".into(),
            state: "available".into(),
            creation_date: Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap(),
        };
        let candidates = vec![
            candidate("ami-old", "x86_64", 1),
            candidate("ami-new", "x86_64", 20),
            candidate("ami-arm", "arm64", 25),
        ];
        let selected = filter.select_latest(&candidates).unwrap();
        assert_eq!(selected.id, "ami-new");
    }

    #[test]
    fn image_filter_rejects_unavailable_images() {
        let filter = ImageFilter::default();
        let mut candidate = ImageCandidate {
            id: "ami-pending".into(),
            architecture: "x86_64".into(),
            virtualization: "hvm".into(),
            root_device: "ebs".into(),
            state: "pending".into(),
            creation_date: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        };
        assert!(!filter.matches(&candidate));
        candidate.state = "available".into();
        assert!(filter.matches(&candidate));
    }
}
