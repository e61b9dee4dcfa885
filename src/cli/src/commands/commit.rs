//! `nydus-commit commit` — commit a running container's filesystem state
//! into a new accelerated image extending its base image.

use clap::Args;
use tokio_util::sync::CancellationToken;

use nydus_commit_core::config::{BaseConfig, Config, RuntimeConfig};
use nydus_commit_runtime::{CommitOption, Workflow};

use super::Cli;

#[derive(Args)]
pub struct CommitArgs {
    /// Target container address (engine://id)
    #[arg(long, env = "CONTAINER")]
    pub container: String,

    /// Target nydus image reference
    #[arg(long, env = "TARGET")]
    pub target: String,

    /// Pause the container during commit
    #[arg(long, env = "PAUSE_CONTAINER")]
    pub pause_container: bool,

    /// The maximum times allowed to be committed
    #[arg(long, default_value_t = 400, env = "MAXIMUM_TIMES")]
    pub maximum_times: usize,

    /// Directory to commit; a value prefixed with '!' excludes the path
    /// from the diff instead
    #[arg(
        long = "with-path",
        alias = "with-mount-path",
        env = "WITH_PATH",
        value_delimiter = ','
    )]
    pub with_path: Vec<String>,
}

/// Split `--with-path` values into include and exclude lists.
fn parse_paths(paths: &[String]) -> (Vec<String>, Vec<String>) {
    let mut with_paths = Vec::new();
    let mut without_paths = Vec::new();

    for path in paths {
        let path = path.trim();
        if let Some(excluded) = path.strip_prefix('!') {
            without_paths.push(excluded.trim_end_matches('/').to_string());
        } else {
            with_paths.push(path.to_string());
        }
    }

    (with_paths, without_paths)
}

pub async fn execute(cli: &Cli, args: &CommitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let base = BaseConfig {
        work_dir: cli.workdir.clone(),
        builder: cli.builder.clone(),
        runtime: RuntimeConfig {
            pouch_addr: cli.pouch_addr.clone(),
            docker_addr: cli.docker_addr.clone(),
        },
    };
    let config = Config::load(cli.config.as_deref(), base)?;

    let (with_paths, without_paths) = parse_paths(&args.with_path);

    tracing::info!(
        container = %args.container,
        target = %args.target,
        maximum_times = args.maximum_times,
        with_paths = ?with_paths,
        without_paths = ?without_paths,
        "committing container"
    );

    let workflow = Workflow::new(config)?;

    // Ctrl-C cancels the commit; the work dir is still removed below.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling commit");
                cancel.cancel();
            }
        });
    }

    let result = workflow
        .commit(
            CommitOption {
                container: args.container.clone(),
                target_ref: args.target.clone(),
                with_paths,
                without_paths,
                pause_container: args.pause_container,
                maximum_times: args.maximum_times,
            },
            cancel,
        )
        .await;
    let cleanup = workflow.destroy();

    result?;
    cleanup?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_paths_split() {
        let values = vec![
            "/guest/x".to_string(),
            "!/guest/x/cache/".to_string(),
            "  /guest/y ".to_string(),
        ];
        let (with_paths, without_paths) = parse_paths(&values);
        assert_eq!(with_paths, vec!["/guest/x", "/guest/y"]);
        assert_eq!(without_paths, vec!["/guest/x/cache"]);
    }

    #[test]
    fn test_parse_paths_empty() {
        let (with_paths, without_paths) = parse_paths(&[]);
        assert!(with_paths.is_empty());
        assert!(without_paths.is_empty());
    }
}
