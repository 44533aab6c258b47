use chrono::{DateTime, Utc};
use serde_derive::Serialize;

use crate::resolve::ResolvedGroup;

/// Trust policy allowing the compute platform to assume a runner role
pub const EC2_ASSUME_ROLE_POLICY: &str = r#"{
    "Version": "2012-10-17",
    "Statement": [
        {
            "Effect": "Allow",
            "Principal": {
                "Service": "ec2.amazonaws.com"
            },
            "Action": "sts:AssumeRole"
        }
    ]
}"#;

/// Baseline grant every generated role receives so hosts can take part in
/// managed-instance bootstrapping
pub const BASELINE_POLICY_ARN: &str = "arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore";

pub const TAG_TOOL: &str = "runner-fleet:tool";
pub const TAG_TOOL_VALUE: &str = "gitlab-runner-fleet";
pub const TAG_GROUP: &str = "runner-fleet:group";
pub const TAG_CREATED_AT: &str = "runner-fleet:created-at";

/// Role and instance profile names share this platform length limit
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Declared by the user and used as-is
    Supplied,
    /// Synthesized for this group, to be created by the provisioner
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Execution identity of a runner group: a role bound 1:1 to an instance
/// profile, plus the policy documents the provisioner applies to it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityBinding {
    pub source: IdentitySource,
    pub role_name: String,
    pub instance_profile_name: String,
    pub assume_role_policy: Option<String>,
    pub managed_policy_arn: Option<String>,
    pub cache_access_policy: Option<String>,
    pub tags: Vec<Tag>,
}

/// Resolve the identity for a group. A supplied identity passes through
/// unchanged; otherwise role and profile names are derived from the group
/// name, so re-resolving the same configuration yields the same binding
pub fn resolve_identity(group: &ResolvedGroup, created_at: DateTime<Utc>) -> IdentityBinding {
    let tags = vec![
        Tag {
            key: TAG_TOOL.into(),
            value: TAG_TOOL_VALUE.into(),
        },
        Tag {
            key: TAG_GROUP.into(),
            value: group.name.clone(),
        },
        Tag {
            key: TAG_CREATED_AT.into(),
            value: created_at.to_rfc3339(),
        },
    ];
    if let Some(supplied) = &group.identity {
        return IdentityBinding {
            source: IdentitySource::Supplied,
            role_name: supplied.role.clone(),
            instance_profile_name: supplied.instance_profile.clone(),
            assume_role_policy: None,
            managed_policy_arn: None,
            cache_access_policy: None,
            tags,
        };
    }
    // role and profile share a name, the binding is 1:1
    let role_name = truncate_name(&format!("{}-runners", group.name));
    IdentityBinding {
        source: IdentitySource::Generated,
        instance_profile_name: role_name.clone(),
        role_name,
        assume_role_policy: Some(EC2_ASSUME_ROLE_POLICY.to_owned()),
        managed_policy_arn: Some(BASELINE_POLICY_ARN.to_owned()),
        cache_access_policy: Some(cache_access_policy(&group.cache.bucket)),
        tags,
    }
}

// Truncate for platform name limits
fn truncate_name(name: &str) -> String {
    name.chars().take(MAX_NAME_LEN).collect()
}

/// Inline policy granting read/write access to the group's cache bucket
pub fn cache_access_policy(bucket: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Sid": "CacheReadAccess",
                "Effect": "Allow",
                "Action": ["s3:GetObject"],
                "Resource": format!("arn:aws:s3:::{}/*", bucket)
            },
            {
                "Sid": "CacheWriteAccess",
                "Effect": "Allow",
                "Action": ["s3:PutObject"],
                "Resource": format!("arn:aws:s3:::{}/*", bucket)
            }
        ]
    })
    .to_string()
}
