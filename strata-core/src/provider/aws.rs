//! `aws` CLI process binding.
//!
//! Implements [`ProviderApi`] and [`ObjectStore`] by invoking the `aws`
//! command line tool with JSON output and parsing its responses. The vendor
//! SDK stays out of the picture; the CLI is the transport. Stderr text is
//! classified into [`ProviderError`] kinds.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::api::*;

/// Provider binding that shells out to the `aws` CLI.
pub struct AwsCli {
    region: String,
}

impl AwsCli {
    /// Create a new binding, resolving the region from the environment or
    /// the CLI's own configuration.
    pub async fn new() -> ProviderResult<Self> {
        let region = match std::env::var("AWS_REGION")
            .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
        {
            Ok(region) if !region.is_empty() => region,
            _ => {
                let out = run_aws(&["configure", "get", "region"], None).await?;
                let region = out.trim().to_string();
                if region.is_empty() {
                    return Err(ProviderError::fatal(
                        "no region configured; set AWS_REGION or run 'aws configure'",
                    ));
                }
                region
            }
        };
        Ok(Self { region })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    async fn run(&self, args: &[&str]) -> ProviderResult<String> {
        run_aws(args, Some(&self.region)).await
    }

    fn change_set_args<'a>(change_set: &'a ChangeSetRef, args: &mut Vec<&'a str>) {
        match change_set {
            ChangeSetRef::Id(id) => {
                args.push("--change-set-name");
                args.push(id);
            }
            ChangeSetRef::Named { name, stack_name } => {
                args.push("--change-set-name");
                args.push(name);
                args.push("--stack-name");
                args.push(stack_name);
            }
        }
    }
}

async fn run_aws(args: &[&str], region: Option<&str>) -> ProviderResult<String> {
    let mut cmd = Command::new("aws");
    cmd.args(args);
    if let Some(region) = region {
        cmd.arg("--region").arg(region);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(Stdio::null());

    debug!("running: aws {}", args.join(" "));

    let output = cmd
        .output()
        .await
        .map_err(|e| ProviderError::new(ErrorKind::Transient, format!("cannot run aws: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify(stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Classify an `aws` CLI stderr line into a provider error.
fn classify(stderr: &str) -> ProviderError {
    let kind = if stderr.contains("Throttling") && stderr.contains("Rate exceeded") {
        ErrorKind::Throttled
    } else if stderr.contains("(ChangeSetNotFound)")
        || stderr.contains("(404)")
        || stderr.contains("Not Found")
        || stderr.contains("(NoSuchKey)")
        || (stderr.contains("(ValidationError)") && stderr.contains("does not exist"))
    {
        ErrorKind::NotFound
    } else if stderr.contains("(ValidationError)") {
        ErrorKind::Validation
    } else if stderr.contains("Could not connect")
        || stderr.contains("Connection was closed")
        || stderr.contains("Read timeout")
    {
        ErrorKind::Transient
    } else {
        ErrorKind::Fatal
    };
    ProviderError::new(kind, stderr.to_string())
}

fn parse_json<T: serde::de::DeserializeOwned>(out: &str) -> ProviderResult<T> {
    serde_json::from_str(out)
        .map_err(|e| ProviderError::fatal(format!("cannot parse provider response: {e}")))
}

/// Scratch file for commands that only accept file arguments for bodies.
struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    fn new(tag: &str) -> Self {
        let name = format!(
            "strata-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
        );
        Self { path: std::env::temp_dir().join(name) }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacksOutput {
    #[serde(default)]
    stacks: Vec<RemoteStack>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStackEventsOutput {
    #[serde(default)]
    stack_events: Vec<RemoteStackEvent>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateChangeSetOutput {
    id: String,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "PascalCase")]
struct HeadObjectOutput {
    e_tag: String,
    version_id: Option<String>,
    content_type: String,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "PascalCase")]
struct PutObjectOutput {
    e_tag: String,
    version_id: Option<String>,
}

#[async_trait]
impl ProviderApi for AwsCli {
    async fn describe_stack(&self, name: &str) -> ProviderResult<Option<RemoteStack>> {
        let out = self
            .run(&[
                "cloudformation",
                "describe-stacks",
                "--stack-name",
                name,
                "--output",
                "json",
            ])
            .await;
        let out = match out {
            Ok(out) => out,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let parsed: DescribeStacksOutput = parse_json(&out)?;
        Ok(parsed.stacks.into_iter().next())
    }

    async fn describe_stack_events(
        &self,
        name: &str,
        _next_token: Option<&str>,
    ) -> ProviderResult<StackEventPage> {
        // The aws CLI aggregates pages itself with json output, so a single
        // call returns the complete listing and the page token stays unused.
        let out = self
            .run(&[
                "cloudformation",
                "describe-stack-events",
                "--stack-name",
                name,
                "--output",
                "json",
            ])
            .await?;
        let parsed: DescribeStackEventsOutput = parse_json(&out)?;
        Ok(StackEventPage { events: parsed.stack_events, next_token: None })
    }

    async fn create_change_set(&self, input: &CreateChangeSetInput) -> ProviderResult<String> {
        let parameters = serde_json::to_string(&input.parameters)
            .map_err(|e| ProviderError::fatal(e.to_string()))?;
        let tags = serde_json::to_string(&input.tags)
            .map_err(|e| ProviderError::fatal(e.to_string()))?;

        let mut args = vec![
            "cloudformation",
            "create-change-set",
            "--stack-name",
            &input.stack_name,
            "--change-set-name",
            &input.change_set_name,
            "--change-set-type",
            &input.change_set_type,
            "--output",
            "json",
        ];
        if !input.parameters.is_empty() {
            args.push("--parameters");
            args.push(&parameters);
        }
        if !input.tags.is_empty() {
            args.push("--tags");
            args.push(&tags);
        }
        if let Some(role_arn) = &input.role_arn {
            args.push("--role-arn");
            args.push(role_arn);
        }
        if let Some(description) = &input.description {
            args.push("--description");
            args.push(description);
        }
        if !input.capabilities.is_empty() {
            args.push("--capabilities");
            for capability in &input.capabilities {
                args.push(capability);
            }
        }
        if let Some(url) = &input.template_url {
            args.push("--template-url");
            args.push(url);
        } else if let Some(body) = &input.template_body {
            args.push("--template-body");
            args.push(body);
        } else if input.use_previous_template {
            args.push("--use-previous-template");
        }

        let out = self.run(&args).await?;
        let parsed: CreateChangeSetOutput = parse_json(&out)?;
        Ok(parsed.id)
    }

    async fn describe_change_set(
        &self,
        change_set: &ChangeSetRef,
        _next_token: Option<&str>,
    ) -> ProviderResult<Option<RemoteChangeSet>> {
        let mut args = vec!["cloudformation", "describe-change-set"];
        Self::change_set_args(change_set, &mut args);
        args.extend(["--output", "json"]);
        match self.run(&args).await {
            Ok(out) => {
                let mut parsed: RemoteChangeSet = parse_json(&out)?;
                parsed.next_token = None;
                Ok(Some(parsed))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn execute_change_set(&self, change_set: &ChangeSetRef) -> ProviderResult<()> {
        let mut args = vec!["cloudformation", "execute-change-set"];
        Self::change_set_args(change_set, &mut args);
        self.run(&args).await.map(|_| ())
    }

    async fn delete_stack(&self, name: &str) -> ProviderResult<()> {
        self.run(&["cloudformation", "delete-stack", "--stack-name", name]).await.map(|_| ())
    }

    async fn caller_identity(&self) -> ProviderResult<CallerIdentity> {
        let out = self.run(&["sts", "get-caller-identity", "--output", "json"]).await?;
        let mut identity: CallerIdentity = parse_json(&out)?;
        identity.region = self.region.clone();
        Ok(identity)
    }
}

#[async_trait]
impl ObjectStore for AwsCli {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        content_type: &str,
    ) -> ProviderResult<ObjectMeta> {
        let scratch = ScratchFile::new("put");
        tokio::fs::write(&scratch.path, body).await.map_err(|e| {
            ProviderError::fatal(format!("cannot stage upload body: {e}"))
        })?;
        let body_arg = format!("fileb://{}", scratch.path.display());

        let out = self
            .run(&[
                "s3api",
                "put-object",
                "--bucket",
                bucket,
                "--key",
                key,
                "--content-type",
                content_type,
                "--body",
                &body_arg,
                "--output",
                "json",
            ])
            .await?;
        let parsed: PutObjectOutput = parse_json(&out)?;
        Ok(ObjectMeta {
            etag: parsed.e_tag,
            version_id: parsed.version_id,
            content_type: content_type.to_string(),
        })
    }

    async fn head(&self, bucket: &str, key: &str) -> ProviderResult<Option<ObjectMeta>> {
        let out = self
            .run(&[
                "s3api",
                "head-object",
                "--bucket",
                bucket,
                "--key",
                key,
                "--output",
                "json",
            ])
            .await;
        match out {
            Ok(out) => {
                let parsed: HeadObjectOutput = parse_json(&out)?;
                Ok(Some(ObjectMeta {
                    etag: parsed.e_tag,
                    version_id: parsed.version_id,
                    content_type: parsed.content_type,
                }))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> ProviderResult<(Vec<u8>, ObjectMeta)> {
        let scratch = ScratchFile::new("get");
        let outfile = scratch.path.display().to_string();
        let mut args = vec![
            "s3api",
            "get-object",
            "--bucket",
            bucket,
            "--key",
            key,
        ];
        if let Some(version_id) = version_id {
            args.push("--version-id");
            args.push(version_id);
        }
        args.push(&outfile);
        args.extend(["--output", "json"]);

        let out = self.run(&args).await?;
        let parsed: HeadObjectOutput = parse_json(&out)?;
        let body = tokio::fs::read(&scratch.path).await.map_err(|e| {
            ProviderError::fatal(format!("cannot read downloaded object: {e}"))
        })?;
        Ok((
            body,
            ObjectMeta {
                etag: parsed.e_tag,
                version_id: parsed.version_id,
                content_type: parsed.content_type,
            },
        ))
    }
}
