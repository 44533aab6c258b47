use itertools::Itertools;
use serde_derive::Serialize;

use crate::config::ExecutorKind;
use crate::resolve::{MachineImage, ResolvedGroup, ResolvedMachine, ResolvedToken};

/// Fixed location the runner-manager process reads its configuration from
pub const MANAGER_CONFIG_PATH: &str = "/etc/gitlab-runner/config.toml";

/// Reduced-idle schedule baked into every machine section: weekday off-hours
/// (00:00-08:00 and 18:00-24:00) and all-day weekends. Only the idle counts
/// and durations applied during these windows are configurable
pub const OFF_PEAK_PERIODS: [&str; 2] =
    ["* * 0-7,18-23 * * mon-fri *", "* * * * * sat,sun *"];

const MACHINE_DRIVER: &str = "amazonec2";
const CACHE_TYPE: &str = "s3";
const CACHE_SERVER_ADDRESS: &str = "s3.amazonaws.com";

/// Placeholder substituted with the fetched secret token during bootstrap
pub fn token_placeholder(name: &str) -> String {
    format!("__RUNNER_TOKEN_{}__", name.to_uppercase().replace('-', "_"))
}

#[derive(Debug, Serialize)]
pub struct ManagerConfig {
    /// Jobs the whole fleet may run concurrently
    pub concurrent: u32,
    /// Seconds between polls for new jobs
    pub check_interval: u32,
    /// One definition per runner group
    pub runners: Vec<RunnerBlock>,
}

#[derive(Debug, Serialize)]
pub struct RunnerBlock {
    pub name: String,
    pub url: String,
    pub token: String,
    pub executor: String,
    pub limit: u32,
    pub environment: Vec<String>,
    pub docker: Option<DockerSection>,
    pub cache: Option<CacheSection>,
    pub machine: Option<MachineSection>,
}

#[derive(Debug, Serialize)]
pub struct DockerSection {
    pub tls_verify: bool,
    pub image: String,
    pub privileged: bool,
    pub volumes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CacheSection {
    #[serde(rename = "Type")]
    pub cache_type: String,
    #[serde(rename = "Shared")]
    pub shared: bool,
    pub s3: S3CacheSection,
}

#[derive(Debug, Serialize)]
pub struct S3CacheSection {
    #[serde(rename = "ServerAddress")]
    pub server_address: String,
    #[serde(rename = "BucketName")]
    pub bucket_name: String,
    #[serde(rename = "BucketLocation")]
    pub bucket_location: String,
}

#[derive(Debug, Serialize)]
pub struct MachineSection {
    #[serde(rename = "IdleCount")]
    pub idle_count: u32,
    #[serde(rename = "IdleTime")]
    pub idle_time: u32,
    #[serde(rename = "MaxBuilds")]
    pub max_builds: u32,
    #[serde(rename = "MachineDriver")]
    pub machine_driver: String,
    #[serde(rename = "MachineName")]
    pub machine_name: String,
    #[serde(rename = "MachineOptions")]
    pub machine_options: Vec<String>,
    #[serde(rename = "OffPeakPeriods")]
    pub off_peak_periods: Vec<String>,
    #[serde(rename = "OffPeakTimezone")]
    pub off_peak_timezone: String,
    #[serde(rename = "OffPeakIdleCount")]
    pub off_peak_idle_count: u32,
    #[serde(rename = "OffPeakIdleTime")]
    pub off_peak_idle_time: u32,
}

impl ManagerConfig {
    pub fn new(concurrent: u32, check_interval: u32, groups: &[ResolvedGroup]) -> ManagerConfig {
        ManagerConfig {
            concurrent,
            check_interval,
            runners: groups.iter().map(RunnerBlock::from_group).collect(),
        }
    }

    pub fn render(&self) -> anyhow::Result<String> {
        Ok(format!(
            "# autogenerated by gitlab-runner-fleet\n{}",
            toml::to_string(self)?
        ))
    }
}

impl RunnerBlock {
    pub fn from_group(group: &ResolvedGroup) -> RunnerBlock {
        let (docker, cache, machine) = match group.executor {
            ExecutorKind::DockerMachine => (
                Some(DockerSection {
                    tls_verify: group.docker.tls_verify,
                    image: group.docker.image.clone(),
                    privileged: group.docker.privileged,
                    volumes: group.docker.volumes.clone(),
                }),
                Some(CacheSection {
                    cache_type: CACHE_TYPE.to_owned(),
                    shared: group.cache.shared,
                    s3: S3CacheSection {
                        server_address: CACHE_SERVER_ADDRESS.to_owned(),
                        bucket_name: group.cache.bucket.clone(),
                        bucket_location: group.cache.region.clone(),
                    },
                }),
                Some(MachineSection::from_group(group)),
            ),
            ExecutorKind::Shell => (None, None, None),
        };
        RunnerBlock {
            name: group.name.clone(),
            url: group.gitlab_url.clone(),
            token: render_token(group),
            executor: executor_name(group.executor).to_owned(),
            limit: group.limit,
            environment: group.environment.clone(),
            docker,
            cache,
            machine,
        }
    }
}

impl MachineSection {
    fn from_group(group: &ResolvedGroup) -> MachineSection {
        MachineSection {
            idle_count: group.idle.count,
            idle_time: group.idle.time,
            max_builds: group.max_builds,
            machine_driver: MACHINE_DRIVER.to_owned(),
            // the driver substitutes the host index for %s
            machine_name: format!("{}-%s", group.name),
            machine_options: machine_options(&group.machine),
            off_peak_periods: OFF_PEAK_PERIODS.iter().map(|s| s.to_string()).collect(),
            off_peak_timezone: group.off_peak.timezone.clone(),
            off_peak_idle_count: group.off_peak.idle_count,
            off_peak_idle_time: group.off_peak.idle_time,
        }
    }
}

fn executor_name(executor: ExecutorKind) -> &'static str {
    match executor {
        ExecutorKind::DockerMachine => "docker+machine",
        ExecutorKind::Shell => "shell",
    }
}

fn render_token(group: &ResolvedGroup) -> String {
    match &group.token {
        ResolvedToken::Value(value) => value.clone(),
        ResolvedToken::SecretParameter(_) => token_placeholder(&group.name),
        // unresolved tokens are rejected before generation is reached
        ResolvedToken::Missing | ResolvedToken::Conflicting => String::new(),
    }
}

/// Machine driver options in their key=value wire form. Spot directives are
/// only present when spot capacity is actually requested
pub fn machine_options(machine: &ResolvedMachine) -> Vec<String> {
    let mut options = vec![
        format!("amazonec2-instance-type={}", machine.instance_type),
        format!("amazonec2-region={}", machine.region),
        format!("amazonec2-vpc-id={}", machine.vpc_id),
        format!("amazonec2-subnet-id={}", machine.subnet_id),
        format!("amazonec2-zone={}", machine.zone),
        format!("amazonec2-security-group={}", machine.security_group),
        "amazonec2-use-private-address=true".to_owned(),
    ];
    if let MachineImage::Id(id) = &machine.image {
        options.push(format!("amazonec2-ami={}", id));
    }
    if let Some(keypair) = &machine.keypair_name {
        options.push(format!("amazonec2-keypair-name={}", keypair));
    }
    if let Some(spot) = machine.spot.as_ref().filter(|spot| spot.enabled) {
        options.push("amazonec2-request-spot-instance=true".to_owned());
        if let Some(price) = spot.price {
            options.push(format!("amazonec2-spot-price={}", price));
        }
    }
    options.extend(
        machine
            .options
            .iter()
            .sorted()
            .map(|(key, value)| format!("{}={}", key, value)),
    );
    options
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rand::{rngs::StdRng, SeedableRng};

    use crate::config::FleetConfig;
    use crate::resolve::{resolve_with, SpotRequest};

    use super::*;

    fn test_group(config: &str) -> ResolvedGroup {
        let fleet: FleetConfig = toml::from_str(config).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let label = fleet.groups.keys().next().unwrap().clone();
        resolve_with(&label, &fleet.groups[&label], &fleet, now, &mut rng)
    }

    fn docker_machine_group() -> ResolvedGroup {
        test_group(
            r#"
            [groups.g]
            name = "ci-linux"
            [groups.g.token]
            value = "tok"
            "#,
        )
    }

    #[test]
    fn zero_valued_numbers_render_literally() {
        let mut group = docker_machine_group();
        group.max_builds = 0;
        let document = ManagerConfig::new(10, 3, &[group]).render().unwrap();
        assert!(document.contains("MaxBuilds = 0"), "{}", document);
    }

    #[test]
    fn spot_directives_are_emitted_only_when_requested() {
        let mut group = docker_machine_group();
        group.machine.spot = Some(SpotRequest {
            enabled: true,
            price: Some(0.05),
        });
        let options = machine_options(&group.machine);
        assert!(options.contains(&"amazonec2-request-spot-instance=true".to_owned()));
        assert!(options.contains(&"amazonec2-spot-price=0.05".to_owned()));

        group.machine.spot = Some(SpotRequest {
            enabled: false,
            price: Some(0.05),
        });
        let options = machine_options(&group.machine);
        assert!(!options.iter().any(|o| o.contains("spot")));

        group.machine.spot = None;
        let options = machine_options(&group.machine);
        assert!(!options.iter().any(|o| o.contains("spot")));
    }

    #[test]
    fn ami_option_appears_only_for_concrete_ids() {
        let mut group = docker_machine_group();
        assert!(!machine_options(&group.machine)
            .iter()
            .any(|o| o.starts_with("amazonec2-ami=")));
        group.machine.image = MachineImage::Id("ami-123".into());
        assert!(machine_options(&group.machine)
            .contains(&"amazonec2-ami=ami-123".to_owned()));
    }

    #[test]
    fn extra_driver_options_pass_through_sorted() {
        let mut group = docker_machine_group();
        group
            .machine
            .options
            .insert("amazonec2-volume-type".into(), "gp3".into());
        group
            .machine
            .options
            .insert("amazonec2-root-size".into(), "16".into());
        let options = machine_options(&group.machine);
        let root = options
            .iter()
            .position(|o| o == "amazonec2-root-size=16")
            .unwrap();
        let volume = options
            .iter()
            .position(|o| o == "amazonec2-volume-type=gp3")
            .unwrap();
        assert!(root < volume);
    }

    #[test]
    fn shell_groups_have_no_driver_sections() {
        let group = test_group(
            r#"
            [groups.g]
            name = "ci-shell"
            executor = "shell"
            [groups.g.token]
            value = "tok"
            "#,
        );
        let block = RunnerBlock::from_group(&group);
        assert_eq!(block.executor, "shell");
        assert!(block.docker.is_none());
        assert!(block.cache.is_none());
        assert!(block.machine.is_none());
        let document = ManagerConfig::new(10, 3, &[group]).render().unwrap();
        assert!(!document.contains("[runners.machine]"));
        assert!(!document.contains("MachineOptions"));
    }

    #[test]
    fn secret_tokens_render_as_placeholders() {
        let group = test_group(
            r#"
            [groups.g]
            name = "ci-linux"
            [groups.g.token]
            secret_parameter = "/runners/ci-linux/token"
            "#,
        );
        let block = RunnerBlock::from_group(&group);
        assert_eq!(block.token, "__RUNNER_TOKEN_CI_LINUX__");
    }

    #[test]
    fn document_carries_global_and_per_group_sections() {
        let group = docker_machine_group();
        let document = ManagerConfig::new(4, 3, &[group]).render().unwrap();
        assert!(document.starts_with("# autogenerated by gitlab-runner-fleet\n"));
        assert!(document.contains("concurrent = 4"));
        assert!(document.contains("check_interval = 3"));
        assert!(document.contains("[[runners]]"));
        assert!(document.contains("name = \"ci-linux\""));
        assert!(document.contains("executor = \"docker+machine\""));
        assert!(document.contains("[runners.docker]"));
        assert!(document.contains("[runners.cache]"));
        assert!(document.contains("[runners.cache.s3]"));
        assert!(document.contains("BucketName = \"ci-linux-cache\""));
        assert!(document.contains("[runners.machine]"));
        assert!(document.contains("MachineName = \"ci-linux-%s\""));
        assert!(document.contains("MachineDriver = \"amazonec2\""));
    }

    #[test]
    fn off_peak_schedule_is_fixed() {
        let group = docker_machine_group();
        let section = MachineSection::from_group(&group);
        assert_eq!(
            section.off_peak_periods,
            vec![
                "* * 0-7,18-23 * * mon-fri *".to_owned(),
                "* * * * * sat,sun *".to_owned()
            ]
        );
        let document = ManagerConfig::new(10, 3, &[group]).render().unwrap();
        assert!(document.contains("OffPeakTimezone = \"UTC\""));
        assert!(document.contains("mon-fri"));
        assert!(document.contains("sat,sun"));
    }
}
