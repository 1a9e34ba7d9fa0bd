//! S3 + DynamoDB backend through the `aws` CLI

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{BackendStore, Ensured};
use crate::error::PhaseName;
use crate::retry::RetryPolicy;
use crate::runner::{CommandOutput, CommandRunner, CommandRunnerExt, CommandSpec};
use crate::{Error, Result};

const ENCRYPTION_CONFIG: &str =
    r#"{"Rules":[{"ApplyServerSideEncryptionByDefault":{"SSEAlgorithm":"AES256"}}]}"#;
const PUBLIC_ACCESS_BLOCK: &str =
    "BlockPublicAcls=true,IgnorePublicAcls=true,BlockPublicPolicy=true,RestrictPublicBuckets=true";

/// Backend store driving the `aws` CLI.
pub struct AwsCliBackend {
    runner: Arc<dyn CommandRunner>,
    region: String,
    policy: RetryPolicy,
}

impl AwsCliBackend {
    /// Create a store in `region`
    pub fn new(runner: Arc<dyn CommandRunner>, region: impl Into<String>) -> Self {
        Self {
            runner,
            region: region.into(),
            policy: RetryPolicy::exponential(3, Duration::from_secs(1), Duration::from_secs(10)),
        }
    }

    fn aws<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new("aws")
            .args(args)
            .args(["--region", self.region.as_str(), "--output", "json"])
    }

    /// Single attempt; callers interpret failures themselves
    async fn query(&self, command: CommandSpec) -> Result<CommandOutput> {
        self.runner.run(&command, None, None).await
    }

    async fn mutate(&self, step: &str, command: CommandSpec) -> Result<()> {
        self.runner
            .run_step(PhaseName::MigrateBackend, step, &command, None, Some(&self.policy))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BackendStore for AwsCliBackend {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let output = self
            .query(self.aws(["s3api", "head-bucket", "--bucket", bucket]))
            .await?;
        if output.success() {
            return Ok(true);
        }
        let err = output.error_text();
        if err.contains("404") || err.contains("Not Found") || err.contains("NoSuchBucket") {
            debug!(bucket = %bucket, "Bucket not found");
            return Ok(false);
        }
        Err(Error::step(PhaseName::MigrateBackend, "check-bucket", err))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<Ensured> {
        let mut command = self.aws(["s3api", "create-bucket", "--bucket", bucket]);
        // us-east-1 rejects an explicit location constraint
        if self.region != "us-east-1" {
            command = command
                .arg("--create-bucket-configuration")
                .arg(format!("LocationConstraint={}", self.region));
        }

        let output = self.query(command).await?;
        if output.success() {
            return Ok(Ensured::Created);
        }
        let err = output.error_text();
        if err.contains("BucketAlreadyOwnedByYou") {
            return Ok(Ensured::AlreadyExists);
        }
        Err(Error::step(PhaseName::MigrateBackend, "create-bucket", err))
    }

    async fn enable_versioning(&self, bucket: &str) -> Result<()> {
        self.mutate(
            "versioning",
            self.aws([
                "s3api",
                "put-bucket-versioning",
                "--bucket",
                bucket,
                "--versioning-configuration",
                "Status=Enabled",
            ]),
        )
        .await
    }

    async fn enable_encryption(&self, bucket: &str) -> Result<()> {
        self.mutate(
            "encryption",
            self.aws([
                "s3api",
                "put-bucket-encryption",
                "--bucket",
                bucket,
                "--server-side-encryption-configuration",
                ENCRYPTION_CONFIG,
            ]),
        )
        .await
    }

    async fn block_public_access(&self, bucket: &str) -> Result<()> {
        self.mutate(
            "public-access-block",
            self.aws([
                "s3api",
                "put-public-access-block",
                "--bucket",
                bucket,
                "--public-access-block-configuration",
                PUBLIC_ACCESS_BLOCK,
            ]),
        )
        .await
    }

    async fn lock_table_exists(&self, table: &str) -> Result<bool> {
        let output = self
            .query(self.aws(["dynamodb", "describe-table", "--table-name", table]))
            .await?;
        if output.success() {
            return Ok(true);
        }
        let err = output.error_text();
        if err.contains("ResourceNotFoundException") {
            return Ok(false);
        }
        Err(Error::step(PhaseName::MigrateBackend, "check-lock-table", err))
    }

    async fn create_lock_table(&self, table: &str) -> Result<Ensured> {
        let output = self
            .query(self.aws([
                "dynamodb",
                "create-table",
                "--table-name",
                table,
                "--attribute-definitions",
                "AttributeName=LockID,AttributeType=S",
                "--key-schema",
                "AttributeName=LockID,KeyType=HASH",
                "--billing-mode",
                "PAY_PER_REQUEST",
            ]))
            .await?;
        if output.success() {
            return Ok(Ensured::Created);
        }
        let err = output.error_text();
        if err.contains("ResourceInUseException") {
            return Ok(Ensured::AlreadyExists);
        }
        Err(Error::step(PhaseName::MigrateBackend, "create-lock-table", err))
    }

    async fn wait_lock_table_active(&self, table: &str) -> Result<()> {
        self.mutate(
            "wait-lock-table",
            self.aws(["dynamodb", "wait", "table-exists", "--table-name", table]),
        )
        .await
    }
}
