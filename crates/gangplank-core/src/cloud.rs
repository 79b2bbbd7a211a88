//! Cloud publication targets.
//!
//! Publish targets are a closed tagged variant rather than a dynamically
//! dispatched trait object, so an unsupported cloud name is rejected at
//! parse time instead of failing deep inside a publish call. Unknown
//! clouds are a configuration error, not a publish-time failure.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloudTarget {
    Aliyun,
    Aws,
    AwsCn,
    Azure,
    Gcp,
}

impl CloudTarget {
    /// The shell command that publishes a built image for `build_id` to
    /// this cloud. Gangplank only renders the command; invoking the
    /// underlying publish tooling is the worker's job.
    pub fn render_command(&self, build_id: &str) -> String {
        match self {
            CloudTarget::Aliyun => format!("ore aliyun upload --build={build_id}"),
            CloudTarget::Aws => format!("ore aws upload --build={build_id}"),
            CloudTarget::AwsCn => format!("ore aws --region cn-north-1 upload --build={build_id}"),
            CloudTarget::Azure => format!("ore azure upload --build={build_id}"),
            CloudTarget::Gcp => format!("ore gcloud upload --build={build_id}"),
        }
    }
}

impl FromStr for CloudTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aliyun" => Ok(CloudTarget::Aliyun),
            "aws" => Ok(CloudTarget::Aws),
            "aws-cn" => Ok(CloudTarget::AwsCn),
            "azure" => Ok(CloudTarget::Azure),
            "gcp" => Ok(CloudTarget::Gcp),
            other => Err(Error::Config(format!("unknown cloud target: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_cloud_is_a_config_error() {
        assert!(CloudTarget::from_str("fly-io").is_err());
    }

    #[test]
    fn known_clouds_render_a_command() {
        let cmd = CloudTarget::Aws.render_command("412.86.0");
        assert!(cmd.contains("412.86.0"));
    }
}
