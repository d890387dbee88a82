use std::{net::Ipv6Addr, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{
    Method,
    blocking::{Client, RequestBuilder},
    header::AUTHORIZATION,
};
use serde::de::DeserializeOwned;
use tracing as log;

use super::{
    PollPolicy, PrismPort,
    types::{
        ContainerInfo, SnapshotDescriptor, SnapshotSpec, SnapshotSpecList, TaskCreated, TaskInfo,
        VmDescriptor, VmList,
    },
};
use crate::error::BackupError;

const DEFAULT_PORT: u16 = 9440;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PrismSettings {
    /// `host` or `host:port`; the port defaults to 9440.
    pub host: String,
    pub username: String,
    pub password: String,
    pub verify_tls: bool,
    pub poll: PollPolicy,
}

impl std::fmt::Debug for PrismSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrismSettings")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("verify_tls", &self.verify_tls)
            .field("poll", &self.poll)
            .finish()
    }
}

/// Blocking HTTP client for the v1 and v0.8 (AHV) Prism APIs.
pub struct PrismHttp {
    client: Client,
    auth: String,
    v1: String,
    ahv: String,
    poll: PollPolicy,
}

impl PrismHttp {
    /// Builds the client and checks credentials against `v1/cluster`.
    pub fn connect(settings: &PrismSettings) -> Result<Self, BackupError> {
        let prism = Self::new(settings)?;
        let url = prism.v1_url("cluster");
        prism.send(prism.request(Method::GET, &url), &url)?;
        log::info!("[prism] connected to {}", settings.host);
        Ok(prism)
    }

    fn new(settings: &PrismSettings) -> Result<Self, BackupError> {
        let (v1, ahv) = base_urls(&settings.host);
        if !settings.verify_tls {
            log::warn!("[prism] TLS certificate verification is disabled");
        }
        let client = Client::builder()
            .danger_accept_invalid_certs(!settings.verify_tls)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| BackupError::Transport {
                url: v1.clone(),
                source,
            })?;

        Ok(Self {
            client,
            auth: basic_auth(&settings.username, &settings.password),
            v1,
            ahv,
            poll: settings.poll,
        })
    }

    #[inline]
    fn v1_url(&self, path: &str) -> String {
        format!("{}{}", self.v1, path)
    }

    #[inline]
    fn ahv_url(&self, path: &str) -> String {
        format!("{}{}", self.ahv, path)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        log::debug!("[prism] {method} {url}");
        self.client
            .request(method, url)
            .header(AUTHORIZATION, &self.auth)
    }

    fn send(&self, req: RequestBuilder, url: &str) -> Result<String, BackupError> {
        let transport = |source| BackupError::Transport {
            url: url.to_string(),
            source,
        };
        let resp = req.send().map_err(transport)?;
        let status = resp.status().as_u16();
        let body = resp.text().map_err(transport)?;
        check_status(url, status, body)
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> Result<T, BackupError> {
        let body = self.send(self.request(Method::GET, url), url)?;
        decode(what, &body)
    }
}

impl PrismPort for PrismHttp {
    fn list_vms(&self) -> Result<Vec<VmDescriptor>, BackupError> {
        let url = self.ahv_url("vms?includeVMDiskSizes=true");
        let list: VmList = self.get_json(&url, "VM list")?;
        Ok(list.entities)
    }

    fn create_snapshot(&self, vm_uuid: &str, name: &str) -> Result<String, BackupError> {
        let url = self.ahv_url("snapshots");
        let spec = SnapshotSpecList {
            snapshot_specs: [SnapshotSpec {
                vm_uuid,
                snapshot_name: name,
            }],
        };
        let body = self.send(self.request(Method::POST, &url).json(&spec), &url)?;
        let created: TaskCreated = decode("snapshot create response", &body)?;
        Ok(created.task_uuid)
    }

    fn delete_snapshot(&self, snapshot_uuid: &str) -> Result<String, BackupError> {
        let url = self.ahv_url(&format!("snapshots/{snapshot_uuid}"));
        let body = self.send(self.request(Method::DELETE, &url), &url)?;
        let created: TaskCreated = decode("snapshot delete response", &body)?;
        Ok(created.task_uuid)
    }

    fn get_snapshot(&self, snapshot_uuid: &str) -> Result<SnapshotDescriptor, BackupError> {
        let url = self.ahv_url(&format!("snapshots/{snapshot_uuid}"));
        self.get_json(&url, &format!("snapshot {snapshot_uuid}"))
    }

    fn get_task(&self, task_uuid: &str) -> Result<TaskInfo, BackupError> {
        let url = self.ahv_url(&format!("tasks/{task_uuid}?includeEntityNames=true"));
        self.get_json(&url, &format!("task {task_uuid}"))
    }

    fn container_name(&self, container_uuid: &str) -> Result<String, BackupError> {
        let url = self.v1_url(&format!("containers/{container_uuid}"));
        let info: ContainerInfo = self.get_json(&url, &format!("container {container_uuid}"))?;
        Ok(info.name)
    }

    fn poll_policy(&self) -> PollPolicy {
        self.poll
    }
}

fn base_urls(host: &str) -> (String, String) {
    let authority = authority(host.trim().trim_end_matches('/'));
    (
        format!("https://{authority}/PrismGateway/services/rest/v1/"),
        format!("https://{authority}/api/nutanix/v0.8/"),
    )
}

/// `host[:port]`, `[v6][:port]` or a bare IPv6 literal, with the port filled in.
fn authority(host: &str) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        return format!("[{host}]:{DEFAULT_PORT}");
    }
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((_, "")) => format!("{host}:{DEFAULT_PORT}"),
            _ => host.to_string(),
        };
    }
    match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => host.to_string(),
        _ => format!("{host}:{DEFAULT_PORT}"),
    }
}

fn basic_auth(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

/// 401 is always an authentication failure, whatever the body says.
fn check_status(url: &str, status: u16, body: String) -> Result<String, BackupError> {
    match status {
        401 => Err(BackupError::Authentication {
            url: url.to_string(),
        }),
        200..=299 => Ok(body),
        _ => {
            log::error!("[prism] {url} answered {status}: {body}");
            Err(BackupError::Api {
                url: url.to_string(),
                status,
                body,
            })
        }
    }
}

fn decode<T: DeserializeOwned>(what: &str, body: &str) -> Result<T, BackupError> {
    serde_json::from_str(body).map_err(|source| {
        log::debug!("[prism] undecodable {what}: {body}");
        BackupError::Decode {
            what: what.to_string(),
            source,
        }
    })
}
