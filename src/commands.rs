use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::Cli;
use crate::error::UploadError;
use crate::upload::throughput::Throughput;
use crate::upload::{upload_tree, UploadOptions};
use crate::webdav::{Connector, DavClient, DavConfig, WebDav};

pub fn execute(cli: Cli) -> Result<()> {
    let options = cli.upload_options();
    let config = cli.dav_config();

    if config.accept_invalid_certs {
        warn!("TLS certificate verification is disabled for this server; pass --strict-tls to enable it");
    }

    info!(
        local = %cli.local.display(),
        remote = %cli.remote,
        url = %config.base_url,
        user = %config.credentials.username,
        workers = options.workers,
        chunk_size = options.chunk_size,
        "starting upload"
    );

    // Run the async upload
    tokio::runtime::Runtime::new()?
        .block_on(async { run_upload(&cli.local, &cli.remote, config, &options).await })
}

async fn run_upload(
    local: &Path,
    remote: &str,
    config: DavConfig,
    options: &UploadOptions,
) -> Result<()> {
    let connector = Arc::new(WebDav::new(config).context("invalid WebDAV configuration")?);

    connector
        .client()
        .map_err(UploadError::Connect)?
        .connect()
        .await
        .map_err(UploadError::Connect)
        .context("can not connect to webdav")?;

    let report = upload_tree(&connector, local, remote, options)
        .await
        .context("can not upload to webdav")?;

    info!(
        files = report.files,
        directories = report.directories,
        skipped = report.skipped,
        bytes = report.bytes,
        elapsed_ms = report.elapsed.as_millis() as u64,
        throughput = %Throughput::new(report.bytes, report.elapsed),
        "upload finished"
    );
    Ok(())
}
