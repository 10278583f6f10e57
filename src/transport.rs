//! Outbound HTTP calls between nodes. Every request carries an explicit
//! timeout and a codec token as its body.

use std::time::Duration;

use serde::Serialize;

use crate::codec::Codec;
use crate::error::TransportError;
use crate::types::{Message, RouteEntry, Submission, SubmissionReceipt};
use crate::wire::{
    DelegateRequest, HeartbeatRequest, HistoryRequest, ManageModem, RouterStatus,
    RouterStatusRequest, RoutingRequest, WatchdogRequest, API_PREFIX,
};

/// Codec-aware HTTP client shared by gossip, delegation and dispatch.
#[derive(Clone)]
pub struct NodeClient {
    http: reqwest::Client,
    codec: Codec,
    timeout: Duration,
    delivery_timeout: Duration,
}

impl NodeClient {
    pub fn new(
        codec: Codec,
        timeout: Duration,
        delivery_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self {
            http,
            codec,
            timeout,
            delivery_timeout,
        })
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    fn api_url(base: &str, endpoint: &str) -> String {
        format!("{}{}/{}", base.trim_end_matches('/'), API_PREFIX, endpoint)
    }

    /// POST an encoded body, returning the raw response body on 2xx.
    async fn post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let token = self.codec.encode(body)?;
        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/json;charset=utf-8")
            .timeout(timeout)
            .body(token)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .text()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })
    }

    /// Push the full routing table to a peer WIS.
    pub async fn send_routes(&self, base: &str, routes: &[RouteEntry]) -> Result<(), TransportError> {
        let url = Self::api_url(base, "receiverouting");
        self.post(&url, routes, self.timeout).await.map(|_| ())
    }

    /// Pull a peer's full routing table.
    pub async fn request_routes(&self, base: &str) -> Result<Vec<RouteEntry>, TransportError> {
        let url = Self::api_url(base, "requestrouting");
        let body = self.post(&url, &RoutingRequest::peers(), self.timeout).await?;
        Ok(self.codec.decode(&body)?)
    }

    /// Reachability probe: `GET <base>/health` must answer 200.
    pub async fn probe(&self, base: &str) -> Result<(), TransportError> {
        let url = format!("{}/health", base.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.clone(),
                source,
            })?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(TransportError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Hand a message to the WIS owning its route.
    pub async fn delegate(&self, base: &str, sms: &Message) -> Result<(), TransportError> {
        let url = Self::api_url(base, "delegatesms");
        let body = DelegateRequest { sms: sms.clone() };
        self.post(&url, &body, self.delivery_timeout).await.map(|_| ())
    }

    /// Hand a message to a dispatcher for sending on one of its sessions.
    pub async fn dispatch(&self, delivery_url: &str, sms: &Message) -> Result<(), TransportError> {
        let url = format!("{}/sendsms", delivery_url.trim_end_matches('/'));
        self.post(&url, sms, self.delivery_timeout).await.map(|_| ())
    }

    /// Register or unregister a modem route. Returns the HTTP code, 500 when
    /// the WIS could not be reached at all.
    pub async fn manage_modem(&self, base: &str, request: &ManageModem) -> u16 {
        let url = Self::api_url(base, "managemodem");
        status_code(self.post(&url, request, self.timeout).await)
    }

    /// Forward a route heartbeat. Same code convention as `manage_modem`.
    pub async fn heartbeat(&self, base: &str, route_id: &str) -> u16 {
        let url = Self::api_url(base, "heartbeat");
        let body = HeartbeatRequest {
            route_id: route_id.to_string(),
        };
        status_code(self.post(&url, &body, self.timeout).await)
    }

    pub async fn submit(
        &self,
        base: &str,
        submission: &Submission,
    ) -> Result<SubmissionReceipt, TransportError> {
        let url = Self::api_url(base, "sendsms");
        let body = self.post(&url, submission, self.delivery_timeout).await?;
        Ok(self.codec.decode(&body)?)
    }

    pub async fn history(&self, base: &str, date: Option<String>) -> Result<Vec<Message>, TransportError> {
        let url = Self::api_url(base, "getsms");
        let request = HistoryRequest {
            get: "sms".to_string(),
            date,
        };
        let body = self.post(&url, &request, self.timeout).await?;
        Ok(self.codec.decode(&body)?)
    }

    pub async fn router_status(&self, base: &str) -> Result<RouterStatus, TransportError> {
        let url = Self::api_url(base, "router");
        let request = RouterStatusRequest {
            action: "status".to_string(),
        };
        let body = self.post(&url, &request, self.timeout).await?;
        Ok(self.codec.decode(&body)?)
    }

    pub async fn wake_watchdog(&self, base: &str) -> Result<(), TransportError> {
        let url = Self::api_url(base, "watchdog");
        let request = WatchdogRequest {
            run: "True".to_string(),
        };
        self.post(&url, &request, self.timeout).await.map(|_| ())
    }
}

fn status_code(result: Result<String, TransportError>) -> u16 {
    match result {
        Ok(_) => 200,
        Err(e) => {
            tracing::warn!("⚠️  {}", e);
            e.status().unwrap_or(500)
        }
    }
}
