use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    actions::ActionQueue,
    data_model::{Certificate, CertificateChain, DecryptData, DownloadResult},
    update_machine::{is_cancel_error, CANCELED_ERROR},
};

/// Downloads and decrypts one package. Transport, retry and decryption live
/// behind this seam.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download_and_decrypt(
        &self,
        token: CancellationToken,
        package: DecryptData,
        chains: &[CertificateChain],
        certs: &[Certificate],
    ) -> Result<DownloadResult>;
}

/// Fans a decrypt request map out through the action queue and collects the
/// per-item results. With `continue_on_error` unset the first failure
/// cancels the remaining downloads; the update's own token is untouched
/// either way.
pub(crate) async fn download_packages(
    downloader: Arc<dyn Downloader>,
    actions: &ActionQueue,
    token: &CancellationToken,
    request: HashMap<String, DecryptData>,
    continue_on_error: bool,
    chains: Vec<CertificateChain>,
    certs: Vec<Certificate>,
) -> HashMap<String, DownloadResult> {
    let results: Arc<Mutex<HashMap<String, DownloadResult>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let group_token = token.child_token();

    for (id, package) in request {
        let downloader = downloader.clone();
        let results = results.clone();
        let group_token = group_token.clone();
        let chains = chains.clone();
        let certs = certs.clone();
        let item_id = id.clone();

        actions.execute(id, async move {
            let result = if group_token.is_cancelled() {
                DownloadResult {
                    error: CANCELED_ERROR.to_string(),
                    ..Default::default()
                }
            } else {
                match downloader
                    .download_and_decrypt(group_token.clone(), package, &chains, &certs)
                    .await
                {
                    Ok(result) => result,
                    Err(err) => {
                        if !continue_on_error {
                            group_token.cancel();
                        }

                        DownloadResult {
                            error: err.to_string(),
                            ..Default::default()
                        }
                    }
                }
            };

            results.lock().unwrap().insert(item_id, result);
        });
    }

    actions.wait().await;

    let results = results.lock().unwrap().drain().collect();
    results
}

/// First non-cancel download error, used as the update error summary.
pub(crate) fn download_error(results: &HashMap<String, DownloadResult>) -> String {
    results
        .values()
        .find(|result| !result.error.is_empty() && !is_cancel_error(&result.error))
        .map(|result| result.error.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;
    use crate::data_model::FileInfo;

    struct ScriptedDownloader {
        failing: Vec<String>,
    }

    #[async_trait]
    impl Downloader for ScriptedDownloader {
        async fn download_and_decrypt(
            &self,
            _token: CancellationToken,
            package: DecryptData,
            _chains: &[CertificateChain],
            _certs: &[Certificate],
        ) -> Result<DownloadResult> {
            let url = package.urls.first().cloned().unwrap_or_default();

            if self.failing.contains(&url) {
                return Err(anyhow!("download failed: {url}"));
            }

            Ok(DownloadResult {
                file_name: format!("/tmp/decrypt/{url}"),
                file_info: FileInfo {
                    size: package.size,
                    ..Default::default()
                },
                error: String::new(),
            })
        }
    }

    fn request_for(ids: &[&str]) -> HashMap<String, DecryptData> {
        ids.iter()
            .map(|id| {
                (
                    id.to_string(),
                    DecryptData {
                        urls: vec![id.to_string()],
                        size: 42,
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_download_continues_on_error() {
        let downloader = Arc::new(ScriptedDownloader {
            failing: vec!["bad".to_string()],
        });
        let actions = ActionQueue::new(10);
        let token = CancellationToken::new();

        let results = download_packages(
            downloader,
            &actions,
            &token,
            request_for(&["good", "bad", "other"]),
            true,
            vec![],
            vec![],
        )
        .await;

        assert_eq!(results.len(), 3);
        assert!(results["good"].error.is_empty());
        assert!(results["bad"].error.contains("download failed"));
        assert!(results["other"].error.is_empty());
        assert_eq!(download_error(&results), "download failed: bad");
    }

    #[tokio::test]
    async fn test_download_results_carry_file_names() {
        let downloader = Arc::new(ScriptedDownloader { failing: vec![] });
        let actions = ActionQueue::new(10);
        let token = CancellationToken::new();

        let results = download_packages(
            downloader,
            &actions,
            &token,
            request_for(&["svc1"]),
            true,
            vec![],
            vec![],
        )
        .await;

        assert_eq!(results["svc1"].file_name, "/tmp/decrypt/svc1");
        assert_eq!(results["svc1"].file_info.size, 42);
        assert!(download_error(&results).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_downloads() {
        let downloader = Arc::new(ScriptedDownloader { failing: vec![] });
        let actions = ActionQueue::new(10);
        let token = CancellationToken::new();
        token.cancel();

        let results = download_packages(
            downloader,
            &actions,
            &token,
            request_for(&["svc1"]),
            true,
            vec![],
            vec![],
        )
        .await;

        assert!(is_cancel_error(&results["svc1"].error));
        // Cancelled items never become the summary error.
        assert!(download_error(&results).is_empty());
    }
}
