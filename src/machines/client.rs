//! Machines API client backed by `reqwest`.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use super::wire::{
    CreateAppRequest, CreateVolumeRequest, LaunchMachineRequest, MachineResponse, VolumeResponse,
};
use super::{LaunchSpec, MachineHandle, MachinesApi, ProviderFuture, VolumeRef, VolumeRequest};
use crate::error::ProviderError;
use crate::http::{self, HTTP_CLIENT};

const APP_POLL_INTERVAL: Duration = Duration::from_secs(1);
const APP_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Authenticated client for one organisation's token.
///
/// A fresh client is built per lifecycle call; no connection state is kept
/// between operations beyond the shared HTTP connection pool.
#[derive(Clone)]
pub struct FlyMachinesClient {
    base_url: String,
    authorization: String,
    app_poll_interval: Duration,
    app_wait_timeout: Duration,
}

impl std::fmt::Debug for FlyMachinesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlyMachinesClient")
            .field("base_url", &self.base_url)
            .field("authorization", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl FlyMachinesClient {
    /// Creates a client for `base_url` authenticating with `token`.
    ///
    /// Tokens already carrying the `FlyV1 ` macaroon scheme are sent as-is;
    /// anything else is sent as a bearer token.
    #[must_use]
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            authorization: http::authorization_value(token),
            app_poll_interval: APP_POLL_INTERVAL,
            app_wait_timeout: APP_WAIT_TIMEOUT,
        }
    }

    /// Overrides how often and how long [`MachinesApi::wait_for_app`] polls.
    #[must_use]
    pub const fn with_app_wait(mut self, interval: Duration, timeout: Duration) -> Self {
        self.app_poll_interval = interval;
        self.app_wait_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn expect_success(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<u8>, ProviderError> {
        http::send_expecting_success(request, &self.authorization).await
    }

    async fn app_exists(&self, app: &str) -> Result<bool, ProviderError> {
        let request = HTTP_CLIENT.get(self.url(&format!("/apps/{app}")));
        let (status, body) = http::send(request, &self.authorization).await?;
        if status.is_success() {
            return Ok(true);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Err(http::remote_error(status, &body))
    }
}

impl MachinesApi for FlyMachinesClient {
    fn create_app<'a>(&'a self, app: &'a str, org: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let payload = CreateAppRequest {
                app_name: app,
                org_slug: org,
            };
            self.expect_success(HTTP_CLIENT.post(self.url("/apps")).json(&payload))
                .await?;
            info!(app, org, "created app");
            self.wait_for_app(app).await
        })
    }

    fn wait_for_app<'a>(&'a self, app: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let started = Instant::now();
            let deadline = started + self.app_wait_timeout;
            loop {
                match self.app_exists(app).await {
                    Ok(true) => return Ok(()),
                    Ok(false) => debug!(app, "app not visible yet"),
                    Err(err) => debug!(app, error = %err, "app lookup failed"),
                }
                if Instant::now() >= deadline {
                    return Err(ProviderError::timeout(
                        format!("app {app}"),
                        started.elapsed(),
                    ));
                }
                sleep(self.app_poll_interval).await;
            }
        })
    }

    fn create_volume<'a>(
        &'a self,
        app: &'a str,
        request: &'a VolumeRequest,
    ) -> ProviderFuture<'a, VolumeRef> {
        Box::pin(async move {
            let payload = CreateVolumeRequest::from(request);
            let body = self
                .expect_success(
                    HTTP_CLIENT
                        .post(self.url(&format!("/apps/{app}/volumes")))
                        .json(&payload),
                )
                .await?;
            let parsed: VolumeResponse = http::decode("volume", &body)?;
            info!(app, volume = %parsed.id, "created volume");
            Ok(VolumeRef {
                id: parsed.id,
                name: parsed.name,
            })
        })
    }

    fn launch_machine<'a>(
        &'a self,
        app: &'a str,
        spec: &'a LaunchSpec,
    ) -> ProviderFuture<'a, MachineHandle> {
        Box::pin(async move {
            let payload = LaunchMachineRequest::from(spec);
            let body = self
                .expect_success(
                    HTTP_CLIENT
                        .post(self.url(&format!("/apps/{app}/machines")))
                        .json(&payload),
                )
                .await?;
            let parsed: MachineResponse = http::decode("machine", &body)?;
            info!(app, machine = %parsed.id, "launched machine");
            Ok(MachineHandle::from(parsed))
        })
    }

    fn list_machines<'a>(&'a self, app: &'a str) -> ProviderFuture<'a, Vec<MachineHandle>> {
        Box::pin(async move {
            let body = self
                .expect_success(HTTP_CLIENT.get(self.url(&format!("/apps/{app}/machines"))))
                .await?;
            let parsed: Vec<MachineResponse> = http::decode("machine list", &body)?;
            Ok(parsed.into_iter().map(MachineHandle::from).collect())
        })
    }

    fn start_machine<'a>(&'a self, app: &'a str, machine_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.expect_success(
                HTTP_CLIENT.post(self.url(&format!("/apps/{app}/machines/{machine_id}/start"))),
            )
            .await?;
            info!(app, machine = machine_id, "started machine");
            Ok(())
        })
    }

    fn stop_machine<'a>(&'a self, app: &'a str, machine_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.expect_success(
                HTTP_CLIENT.post(self.url(&format!("/apps/{app}/machines/{machine_id}/stop"))),
            )
            .await?;
            info!(app, machine = machine_id, "stopped machine");
            Ok(())
        })
    }

    fn destroy_machine<'a>(
        &'a self,
        app: &'a str,
        machine_id: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.expect_success(
                HTTP_CLIENT
                    .delete(self.url(&format!("/apps/{app}/machines/{machine_id}")))
                    .query(&[("kill", "true")]),
            )
            .await?;
            info!(app, machine = machine_id, "destroyed machine");
            Ok(())
        })
    }

    fn destroy_app<'a>(&'a self, app: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.expect_success(HTTP_CLIENT.delete(self.url(&format!("/apps/{app}"))))
                .await?;
            info!(app, "deleted app");
            Ok(())
        })
    }
}
