use clap::Parser;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

use crate::upload::{RetryPolicy, UploadOptions};
use crate::webdav::{Credentials, DavConfig};

/// Largest accepted `--chunk-size-mib` (4 GiB chunks)
const MAX_CHUNK_SIZE_MIB: u64 = 4096;

#[derive(Parser, Debug)]
#[command(name = "webdav_uploader")]
#[command(about = "Upload a file or directory tree to a WebDAV server in concurrent chunks", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Local file or directory to upload
    #[arg(short, long)]
    pub local: PathBuf,

    /// Remote destination directory
    #[arg(short, long)]
    pub remote: String,

    /// WebDAV endpoint URL
    #[arg(short, long, env = "WEBDAV_URL")]
    pub url: String,

    /// WebDAV username
    #[arg(short = 'U', long, env = "DAV_USER")]
    pub user: String,

    /// WebDAV password
    #[arg(short = 'P', long, env = "DAV_PWD", hide_env_values = true)]
    pub pwd: String,

    /// Skip entries whose path relative to the uploaded directory matches this regex
    #[arg(short, long, value_parser = parse_exclude)]
    pub exclude: Option<Regex>,

    /// Concurrent chunk uploads per file
    #[arg(short, long, default_value = "4", value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Maximum chunk size in MiB
    #[arg(long, default_value = "32", value_parser = clap::value_parser!(u64).range(1..=MAX_CHUNK_SIZE_MIB))]
    pub chunk_size_mib: u64,

    /// Attempts per chunk before the file is given up
    #[arg(long, default_value = "10", value_parser = clap::value_parser!(u32).range(1..))]
    pub retries: u32,

    /// Verify the server's TLS certificate (off by default to allow self-signed servers)
    #[arg(long)]
    pub strict_tls: bool,

    /// Abort a request after this many seconds without any data moving
    #[arg(long, default_value = "300", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_secs: u64,
}

fn parse_exclude(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(pattern)
}

impl Cli {
    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions {
            chunk_size: self.chunk_size_mib * 1024 * 1024,
            workers: usize::from(self.workers),
            retry: RetryPolicy::new(self.retries),
            exclude: self.exclude.clone(),
        }
    }

    pub fn dav_config(&self) -> DavConfig {
        let mut config = DavConfig::new(
            self.url.clone(),
            Credentials::new(self.user.clone(), self.pwd.clone()),
        );
        config.accept_invalid_certs = !self.strict_tls;
        config.read_timeout = Duration::from_secs(self.timeout_secs);
        config
    }
}
