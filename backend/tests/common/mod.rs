use std::path::PathBuf;

use anyhow::{anyhow, ensure, Context, Result};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use spends_tracker::config::AppConfig;
use spends_tracker::db;
use spends_tracker::routes;
use spends_tracker::state::AppState;
use spends_tracker::storage::{BlobStorage, LocalBlobStorage};
use spends_tracker::store::{AttachmentStore, LedgerIssue};
use tempfile::TempDir;
use tower::util::ServiceExt;
use uuid::Uuid;

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
pub struct AttachmentInfo {
    pub id: Uuid,
    pub purchase_id: Uuid,
    pub original_name: String,
    pub stored_name: String,
    pub category: String,
    pub media_type: String,
    pub byte_size: i64,
    pub content_hash: String,
    pub reference_count: i64,
    pub created_at: String,
    pub updated_at: Option<String>,
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    uploads_dir: PathBuf,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        Self::with_upload_limit(spends_tracker::config::DEFAULT_MAX_UPLOAD_BYTES).await
    }

    pub async fn with_upload_limit(max_upload_bytes: usize) -> Result<Self> {
        let dir = tempfile::tempdir().context("failed to create temp dir")?;
        let database_path = dir.path().join("spends.db");
        let uploads_dir = dir.path().join("uploads");

        let config = AppConfig {
            database_url: database_path
                .to_str()
                .ok_or_else(|| anyhow!("temp path is not UTF-8"))?
                .to_string(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            cors_allowed_origin: None,
            uploads_dir: uploads_dir.clone(),
            max_upload_bytes,
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        let migration_pool = pool.clone();
        tokio::task::spawn_blocking(move || db::run_migrations(&migration_pool))
            .await
            .context("migration task panicked")??;

        let store = AttachmentStore::from_config(pool.clone(), &config)?;
        let state = AppState::new(pool, config, store);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            uploads_dir,
            _dir: dir,
        })
    }

    pub async fn create_purchase(&self, product_name: &str) -> Result<Uuid> {
        #[derive(Serialize)]
        struct Payload<'a> {
            product_name: &'a str,
            price_cents: i64,
            purchase_date: &'a str,
        }
        #[derive(Deserialize)]
        struct Created {
            id: Uuid,
        }

        let response = self
            .post_json(
                "/api/purchases",
                &Payload {
                    product_name,
                    price_cents: 12_999,
                    purchase_date: "2025-01-15",
                },
            )
            .await?;
        ensure!(
            response.status() == StatusCode::CREATED,
            "purchase creation failed with status {}",
            response.status()
        );
        let created: Created = serde_json::from_slice(&body_to_vec(response.into_body()).await?)?;
        Ok(created.id)
    }

    /// Uploads and returns the status plus the parsed record when one came back.
    #[allow(dead_code)]
    pub async fn upload_attachment(
        &self,
        purchase_id: Uuid,
        filename: &str,
        content_type: &str,
        data: &[u8],
        category: &str,
    ) -> Result<(StatusCode, Option<AttachmentInfo>)> {
        let response = self
            .upload(
                &format!("/api/attachments/{purchase_id}"),
                Some(filename),
                content_type,
                data,
                &[("category", category)],
            )
            .await?;
        let status = response.status();
        let body = body_to_vec(response.into_body()).await?;
        let parsed = if status.is_success() {
            Some(serde_json::from_slice(&body)?)
        } else {
            None
        };
        Ok((status, parsed))
    }

    #[allow(dead_code)]
    pub async fn blob_file_count(&self) -> Result<usize> {
        let storage = LocalBlobStorage::open(self.uploads_dir.clone())?;
        Ok(storage.list_blobs().await?.len())
    }

    #[allow(dead_code)]
    pub fn blob_path(&self, info: &AttachmentInfo) -> PathBuf {
        let hash = &info.content_hash;
        self.uploads_dir
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(&info.stored_name)
    }

    #[allow(dead_code)]
    pub async fn ledger_issues(&self) -> Result<Vec<LedgerIssue>> {
        Ok(self.state.store.verify_ledger().await?)
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body))?;
        self.send(request).await
    }

    #[allow(dead_code)]
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let request = Request::builder()
            .method(Method::PATCH)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body))?;
        self.send(request).await
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())?;
        self.send(request).await
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(path)
            .body(Body::empty())?;
        self.send(request).await
    }

    #[allow(dead_code)]
    pub async fn upload(
        &self,
        path: &str,
        filename: Option<&str>,
        content_type: &str,
        data: &[u8],
        fields: &[(&str, &str)],
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        match filename {
            Some(filename) => body.extend(
                format!(
                    "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend(b"Content-Disposition: form-data; name=\"file\"\r\n"),
        }
        body.extend(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
        body.extend(data);
        body.extend(b"\r\n");

        for (name, value) in fields {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            );
            body.extend(value.as_bytes());
            body.extend(b"\r\n");
        }
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))?;
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> Result<hyper::Response<Body>> {
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn json_body<T: serde::de::DeserializeOwned>(
    response: hyper::Response<Body>,
) -> Result<T> {
    let body = body_to_vec(response.into_body()).await?;
    serde_json::from_slice(&body).context("response body is not the expected JSON")
}
