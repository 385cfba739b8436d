use std::sync::Arc;

use acme_manager::{AcmeManager, ArtifactKind};
use fs_err as fs;
use rocket::{
    delete, get,
    http::Status,
    post, put,
    request::{FromParam, FromRequest, Outcome, Request},
    routes,
    serde::json::Json,
    Route, State,
};
use serde_json::Value;
use tracing::error;

use crate::config::ApiConfig;

/// Request guard for the /acme endpoints. An empty configured token lets
/// every request through, for deployments that authenticate upstream.
pub struct ApiToken;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ApiToken {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(config) = request.rocket().state::<ApiConfig>() else {
            return Outcome::Error((Status::InternalServerError, ()));
        };
        if config.auth_token.is_empty() {
            return Outcome::Success(ApiToken);
        }
        let authorized = request
            .headers()
            .get_one("Authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token == config.auth_token)
            .unwrap_or(false);
        if authorized {
            Outcome::Success(ApiToken)
        } else {
            Outcome::Error((Status::Unauthorized, ()))
        }
    }
}

/// The four artifact files reachable over the API.
pub struct Target(ArtifactKind);

impl<'r> FromParam<'r> for Target {
    type Error = &'r str;

    fn from_param(param: &'r str) -> Result<Self, Self::Error> {
        match param {
            "account-key" => Ok(Target(ArtifactKind::AccountKey)),
            "cert" => Ok(Target(ArtifactKind::Cert)),
            "cert-key" => Ok(Target(ArtifactKind::CertKey)),
            "cert-authorities" => Ok(Target(ArtifactKind::CertAuthorities)),
            other => Err(other),
        }
    }
}

#[get("/status")]
fn status(manager: &State<Arc<AcmeManager>>, _token: ApiToken) -> Json<Value> {
    Json(manager.status())
}

#[post("/update")]
fn update(manager: &State<Arc<AcmeManager>>, _token: ApiToken) -> Status {
    if manager.trigger_update() {
        Status::Ok
    } else {
        Status::Conflict
    }
}

#[put("/<target>", data = "<body>")]
async fn put_artifact(
    target: Target,
    body: Vec<u8>,
    manager: &State<Arc<AcmeManager>>,
    _token: ApiToken,
) -> Status {
    let path = match manager.artifact_path(target.0) {
        Ok(path) => path,
        Err(err) => {
            error!("failed to resolve artifact path: {err:#}");
            return Status::InternalServerError;
        }
    };
    // Uploads never overwrite; delete the file first to replace it.
    if path.exists() {
        return Status::Conflict;
    }
    match fs::write(&path, &body) {
        Ok(()) => Status::Ok,
        Err(err) => {
            error!("failed to write {}: {err}", path.display());
            Status::InternalServerError
        }
    }
}

#[delete("/<target>")]
fn delete_artifact(
    target: Target,
    manager: &State<Arc<AcmeManager>>,
    _token: ApiToken,
) -> Status {
    let path = match manager.artifact_path(target.0) {
        Ok(path) => path,
        Err(err) => {
            error!("failed to resolve artifact path: {err:#}");
            return Status::InternalServerError;
        }
    };
    match fs::remove_file(&path) {
        Ok(()) => Status::Ok,
        Err(err) => {
            error!("failed to remove {}: {err}", path.display());
            Status::InternalServerError
        }
    }
}

pub fn routes() -> Vec<Route> {
    routes![status, update, put_artifact, delete_artifact]
}

#[cfg(test)]
mod tests {
    use super::*;
    use acme_manager::{AcmeSettings, SettingsLoader};
    use rocket::local::asynchronous::Client;
    use tempfile::TempDir;

    fn test_rocket(dir: &TempDir, auth_token: &str) -> rocket::Rocket<rocket::Build> {
        let data_dir = dir.path().to_path_buf();
        let loader: SettingsLoader =
            Arc::new(move || Ok(AcmeSettings::builder().data_dir(data_dir.clone()).build()));
        rocket::build()
            .manage(AcmeManager::new(loader))
            .manage(ApiConfig {
                auth_token: auth_token.to_string(),
            })
            .mount("/acme", routes())
    }

    #[rocket::async_test]
    async fn status_reports_all_subsystems() {
        let dir = TempDir::new().unwrap();
        let client = Client::tracked(test_rocket(&dir, "")).await.unwrap();

        let response = client.get("/acme/status").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = response.into_json().await.unwrap();
        for sub in ["directory", "account", "certificate"] {
            assert_eq!(body[sub]["status"], "unknown");
        }
    }

    #[rocket::async_test]
    async fn put_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cert.pem"), "existing").unwrap();
        let client = Client::tracked(test_rocket(&dir, "")).await.unwrap();

        let response = client.put("/acme/cert").body("new").dispatch().await;
        assert_eq!(response.status(), Status::Conflict);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cert.pem")).unwrap(),
            "existing"
        );
    }

    #[rocket::async_test]
    async fn put_then_delete_round_trips() {
        let dir = TempDir::new().unwrap();
        let client = Client::tracked(test_rocket(&dir, "")).await.unwrap();

        let response = client
            .put("/acme/cert-authorities")
            .body("-----BEGIN CERTIFICATE-----")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let path = dir.path().join("authority.pem");
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "-----BEGIN CERTIFICATE-----"
        );

        let response = client.delete("/acme/cert-authorities").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert!(!path.exists());

        // Deleting what is not there is an I/O failure, not a no-op.
        let response = client.delete("/acme/cert-authorities").dispatch().await;
        assert_eq!(response.status(), Status::InternalServerError);
    }

    #[rocket::async_test]
    async fn unknown_target_is_not_found() {
        let dir = TempDir::new().unwrap();
        let client = Client::tracked(test_rocket(&dir, "")).await.unwrap();

        let response = client.put("/acme/other").body("x").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
    }

    #[rocket::async_test]
    async fn bearer_token_is_enforced() {
        let dir = TempDir::new().unwrap();
        let client = Client::tracked(test_rocket(&dir, "secret")).await.unwrap();

        let response = client.get("/acme/status").dispatch().await;
        assert_eq!(response.status(), Status::Unauthorized);

        let response = client
            .get("/acme/status")
            .header(rocket::http::Header::new("Authorization", "Bearer secret"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
    }

    #[rocket::async_test]
    async fn forced_update_starts_a_cycle() {
        let dir = TempDir::new().unwrap();
        let client = Client::tracked(test_rocket(&dir, "")).await.unwrap();

        // The client is disabled in the test settings, so the spawned cycle
        // finishes immediately and never goes pending.
        let response = client.post("/acme/update").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
    }
}
