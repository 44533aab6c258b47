use anyhow::Context;
use documented::DocumentedFields;
use inkjet::{
    formatter::Terminal,
    theme::{vendored, Theme},
    Highlighter, Language,
};
use itertools::Itertools;
use log::warn;
use std::{
    collections::HashMap,
    fs::read_to_string,
    io::Write,
    path::{Path, PathBuf},
};
use struct_field_names_as_array::FieldNamesAsArray;
use termcolor::{ColorChoice, StandardStream};
use toml_edit::{DocumentMut, RawString};

use serde_derive::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "gitlab-runner-fleet.toml";
pub const OUTPUT_DIR_NAME: &str = "gitlab-runner-fleet";

pub fn get_default_config_file_path() -> PathBuf {
    dirs::config_dir().unwrap().join(CONFIG_FILE_NAME)
}

pub fn get_default_output_dir() -> PathBuf {
    dirs::data_local_dir().unwrap().join(OUTPUT_DIR_NAME)
}

pub fn get_token_placeholder() -> String {
    "enter-your-token-here".into()
}

// workaround for serde issues related to default values
fn default_gitlab_url() -> String {
    "https://gitlab.com".into()
}

fn default_concurrent() -> u32 {
    10
}

fn default_check_interval() -> u32 {
    3
}

fn default_stack() -> String {
    "ci".into()
}

fn default_region() -> String {
    "us-east-1".into()
}

#[derive(Debug, Clone, DocumentedFields, FieldNamesAsArray, Deserialize, Serialize)]
pub struct DeploymentContext {
    /// Stack identifier scoping the names of all generated resources
    #[serde(default = "default_stack")]
    pub stack: String,
    /// Region the fleet is provisioned in
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for DeploymentContext {
    fn default() -> Self {
        DeploymentContext {
            stack: default_stack(),
            region: default_region(),
        }
    }
}

#[derive(Debug, Clone, Default, DocumentedFields, FieldNamesAsArray, Deserialize, Serialize)]
pub struct TokenSource {
    /// Literal runner authentication token, environment variables will be expanded.
    /// Exactly one of value and secret_parameter must resolve to a non-empty value
    pub value: Option<String>,
    /// Name of a managed secret parameter holding the token,
    /// fetched on the manager instance at boot
    pub secret_parameter: Option<String>,
}

#[derive(Debug, Copy, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub enum ExecutorKind {
    #[serde(rename = "docker-machine")]
    /// Jobs run in containers on autoscaled hosts provisioned through the machine driver
    DockerMachine,
    #[serde(rename = "shell")]
    /// Jobs run directly on the manager instance
    Shell,
}

#[derive(Debug, Clone, Default, DocumentedFields, FieldNamesAsArray, Deserialize, Serialize)]
pub struct DockerTemplate {
    /// Image used for jobs that do not declare one, docker:24.0 when unset
    pub image: Option<String>,
    /// Run job containers in privileged mode, on by default so jobs can build images
    pub privileged: Option<bool>,
    /// Verify TLS when talking to the docker daemon, off by default
    pub tls_verify: Option<bool>,
    /// Host paths mounted into every job container, /cache when unset
    pub volumes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, DocumentedFields, FieldNamesAsArray, Deserialize, Serialize)]
pub struct MachineTemplate {
    /// Instance type for autoscaled hosts, the smallest general-purpose class when unset
    pub instance_type: Option<String>,
    /// Concrete machine image id. When unset, the newest image matching the
    /// default search filter (x86_64, EBS-backed, HVM, available) is used
    pub image: Option<String>,
    /// Region the hosts are launched in, the deployment region when unset
    pub region: Option<String>,
    /// VPC the hosts are placed in, derived from the stack name when unset
    pub vpc_id: Option<String>,
    /// Subnet the hosts are placed in, derived from the stack name when unset
    pub subnet_id: Option<String>,
    /// Availability zone suffix within the region
    pub zone: Option<String>,
    /// Security group attached to the hosts, derived from the stack name when unset
    pub security_group: Option<String>,
    /// Key pair name registered with the machine driver, required when key_pair is set
    pub keypair_name: Option<String>,
    /// Request spot capacity instead of on-demand hosts
    pub spot_instances: Option<bool>,
    /// Bid price per instance hour, required when spot capacity is requested
    pub spot_price: Option<f64>,
    /// Additional driver options passed through verbatim as key=value entries
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, DocumentedFields, FieldNamesAsArray, Deserialize, Serialize)]
pub struct CacheTemplate {
    /// Bucket holding the distributed job cache, derived from the group name when unset
    pub bucket: Option<String>,
    /// Region of the cache bucket, the deployment region when unset
    pub region: Option<String>,
    /// Share the cache between runner groups
    pub shared: Option<bool>,
    /// Days until cached objects expire, 0 keeps them forever
    pub expiration_days: Option<u32>,
}

#[derive(Debug, Clone, Default, DocumentedFields, FieldNamesAsArray, Deserialize, Serialize)]
pub struct IdleTemplate {
    /// Hosts kept warm while no jobs are queued
    pub count: Option<u32>,
    /// Seconds a host may stay idle before it is removed
    pub time: Option<u32>,
}

#[derive(Debug, Clone, Default, DocumentedFields, FieldNamesAsArray, Deserialize, Serialize)]
pub struct OffPeakTemplate {
    /// Timezone the off-peak schedule is evaluated in
    pub timezone: Option<String>,
    /// Idle hosts kept during off-peak windows
    pub idle_count: Option<u32>,
    /// Idle seconds during off-peak windows
    pub idle_time: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, DocumentedFields, FieldNamesAsArray, Deserialize, Serialize)]
pub struct SuppliedIdentity {
    /// Existing role the runner hosts assume, used as-is
    pub role: String,
    /// Existing instance profile binding that role
    pub instance_profile: String,
}

#[derive(Debug, Clone, Default, DocumentedFields, FieldNamesAsArray, Deserialize, Serialize)]
pub struct GroupConfig {
    /// Unique name for the runner group, generated from a timestamp
    /// and a random suffix when absent
    pub name: Option<String>,
    /// Executor used for this group's jobs
    pub executor: Option<ExecutorKind>,
    /// Additional environment variables injected into jobs
    pub environment: Option<Vec<String>>,
    /// Jobs a single autoscaled host may run before it is replaced
    pub max_builds: Option<u32>,
    /// Concurrent jobs this group may run, 0 means unlimited
    pub limit: Option<u32>,
    /// External key pair material registered for host SSH access.
    /// Must be referenced by machine.keypair_name
    pub key_pair: Option<String>,
    /// Sources for the runner authentication token
    #[serde(default)]
    pub token: TokenSource,
    /// Docker settings, meaningful for the docker-machine executor
    pub docker: Option<DockerTemplate>,
    /// Machine driver settings for autoscaled hosts
    pub machine: Option<MachineTemplate>,
    /// Distributed cache settings
    pub cache: Option<CacheTemplate>,
    /// Warm capacity kept during regular hours
    pub idle: Option<IdleTemplate>,
    /// Reduced warm capacity applied during the fixed off-peak schedule
    pub off_peak: Option<OffPeakTemplate>,
    /// Existing identity to bind to the hosts instead of generating one
    pub identity: Option<SuppliedIdentity>,
}

#[derive(Debug, DocumentedFields, FieldNamesAsArray, Deserialize, Serialize)]
pub struct FleetConfig {
    /// GitLab instance the runners register against
    #[serde(default = "default_gitlab_url")]
    pub gitlab_url: String,
    /// Jobs the whole fleet may run concurrently
    #[serde(default = "default_concurrent")]
    pub concurrent: u32,
    /// Seconds the manager waits between polls for new jobs
    #[serde(default = "default_check_interval")]
    pub check_interval: u32,
    /// Naming context shared by every generated resource
    #[serde(default)]
    pub deployment: DeploymentContext,
    /// Runner group declarations, keyed by a declaration label.
    /// Each group compiles into one runner definition in the generated
    /// manager configuration plus its own identity and cache coordinates
    pub groups: HashMap<String, GroupConfig>,
}

fn strs_to_strings(strs: &[&str]) -> Vec<String> {
    strs.iter().map(|&s| s.into()).collect()
}

pub fn get_example_config() -> FleetConfig {
    FleetConfig {
        gitlab_url: default_gitlab_url(),
        concurrent: default_concurrent(),
        check_interval: default_check_interval(),
        deployment: DeploymentContext {
            stack: "ci".into(),
            region: "us-east-1".into(),
        },
        groups: [(
            "linux-docker".to_owned(),
            GroupConfig {
                name: None,
                executor: Some(ExecutorKind::DockerMachine),
                environment: Some(strs_to_strings(&["DOCKER_DRIVER=overlay2"])),
                max_builds: Some(10),
                limit: Some(4),
                key_pair: None,
                token: TokenSource {
                    value: Some(get_token_placeholder()),
                    secret_parameter: None,
                },
                docker: Some(DockerTemplate {
                    image: Some("docker:24.0".into()),
                    privileged: Some(true),
                    tls_verify: Some(false),
                    volumes: Some(strs_to_strings(&["/cache"])),
                }),
                machine: Some(MachineTemplate {
                    instance_type: Some("t3.micro".into()),
                    image: None,
                    region: None,
                    vpc_id: None,
                    subnet_id: None,
                    zone: Some("a".into()),
                    security_group: None,
                    keypair_name: None,
                    spot_instances: Some(true),
                    spot_price: Some(0.05),
                    options: [("amazonec2-root-size", "16")]
                        .map(|(k, v)| (k.to_owned(), v.to_owned()))
                        .into_iter()
                        .collect(),
                }),
                cache: Some(CacheTemplate {
                    bucket: None,
                    region: None,
                    shared: Some(false),
                    expiration_days: Some(30),
                }),
                idle: Some(IdleTemplate {
                    count: Some(1),
                    time: Some(1800),
                }),
                off_peak: Some(OffPeakTemplate {
                    timezone: Some("UTC".into()),
                    idle_count: Some(0),
                    idle_time: Some(300),
                }),
                identity: None,
            },
        )]
        .into_iter()
        .collect(),
    }
}

pub fn read_config(filename: &Path) -> anyhow::Result<FleetConfig> {
    let content = read_to_string(filename)?;
    let parsed: FleetConfig = toml::from_str(&content)?;
    let placeholder = get_token_placeholder();
    for (label, group) in &parsed.groups {
        if group.token.value.as_deref() == Some(placeholder.as_str()) {
            warn!(
                "Group {} uses the token placeholder value, registration will fail",
                label
            )
        }
    }
    Ok(parsed)
}

fn annotate_toml_table<T: DocumentedFields>(table: &mut toml_edit::Table) {
    for (mut key, value) in table.iter_mut() {
        let key_name = key.get().to_owned();
        let comments = T::get_field_docs(key_name).map_or("".into(), |comment| {
            format!("# {}\n", comment.lines().join("\n# "))
        });
        match value {
            toml_edit::Item::None => (),
            toml_edit::Item::Value(_) => {
                key.leaf_decor_mut().set_prefix(comments);
            }
            toml_edit::Item::Table(table) => {
                let original_decor = table
                    .decor()
                    .prefix()
                    .map_or(RawString::default(), |v| v.to_owned());
                table.decor_mut().set_prefix(format!(
                    "{}{}",
                    original_decor.as_str().unwrap_or(""),
                    comments
                ));
            }
            // doesn't appear in our configuration
            toml_edit::Item::ArrayOfTables(_) => todo!(),
        };
    }
}

fn annotate_group_table(group: &mut toml_edit::Table) {
    annotate_toml_table::<GroupConfig>(group);
    if let Some(table) = group.get_mut("token").and_then(|v| v.as_table_mut()) {
        annotate_toml_table::<TokenSource>(table);
    }
    if let Some(table) = group.get_mut("docker").and_then(|v| v.as_table_mut()) {
        annotate_toml_table::<DockerTemplate>(table);
    }
    if let Some(table) = group.get_mut("machine").and_then(|v| v.as_table_mut()) {
        annotate_toml_table::<MachineTemplate>(table);
    }
    if let Some(table) = group.get_mut("cache").and_then(|v| v.as_table_mut()) {
        annotate_toml_table::<CacheTemplate>(table);
    }
    if let Some(table) = group.get_mut("idle").and_then(|v| v.as_table_mut()) {
        annotate_toml_table::<IdleTemplate>(table);
    }
    if let Some(table) = group.get_mut("off_peak").and_then(|v| v.as_table_mut()) {
        annotate_toml_table::<OffPeakTemplate>(table);
    }
    if let Some(table) = group.get_mut("identity").and_then(|v| v.as_table_mut()) {
        annotate_toml_table::<SuppliedIdentity>(table);
    }
}

pub fn get_example_config_str() -> String {
    let config = get_example_config();
    let mut document = toml::to_string_pretty(&config)
        .unwrap()
        .parse::<DocumentMut>()
        .unwrap();
    annotate_toml_table::<FleetConfig>(document.as_table_mut());
    annotate_toml_table::<DeploymentContext>(
        document
            .get_mut("deployment")
            .unwrap()
            .as_table_mut()
            .unwrap(),
    );
    {
        let groups = document.get_mut("groups").unwrap();
        for (name, _) in &config.groups {
            annotate_group_table(groups.get_mut(name).unwrap().as_table_mut().unwrap());
        }
    }
    document.to_string()
}

pub fn print_example_config_highlighted() {
    let config = get_example_config_str();
    let mut highlighter = Highlighter::new();
    let language = Language::Toml;
    let theme: Theme = Theme::from_helix(vendored::BASE16_TERMINAL).unwrap();
    let stream = StandardStream::stdout(ColorChoice::Auto);
    let formatter = Terminal::new(theme, stream);
    highlighter
        .highlight_to_writer(language, &formatter, &config, &mut std::io::sink())
        .unwrap();
    println!();
}

pub fn write_example_config(filename: &Path) -> anyhow::Result<()> {
    let mut file = std::fs::File::create_new(filename)
        .context(format!("Failed creating config file {:?}", filename))?;
    file.write_all(get_example_config_str().as_bytes())?;
    Ok(())
}
