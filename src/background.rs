//! 暂存文件清理的后台任务。

use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::atomic::cleanup_stale_staging;
use crate::config::STAGING_CLEAN_INTERVAL_SECS;

/// 启动后台任务：定期清理各上传目录中过期的暂存文件。
pub fn spawn_background_tasks(dirs: Vec<PathBuf>, ttl: Duration) {
    if ttl.is_zero() {
        debug!("staging cleanup disabled");
        return;
    }

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(STAGING_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            for dir in &dirs {
                if let Err(err) = cleanup_stale_staging(dir, ttl).await {
                    warn!(dir = ?dir, error = %err, "staging cleanup failed");
                }
            }
        }
    });
}
