//! Kubernetes Secret backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, trace};

use super::{SecretBackend, SecretKind, SecretPayload};
use crate::error::BackendError;
use crate::model::SecretRef;

/// Stores secrets as Kubernetes `Secret` objects
#[derive(Clone)]
pub struct KubeSecretBackend {
    client: Client,
}

impl KubeSecretBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl std::fmt::Debug for KubeSecretBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSecretBackend").finish_non_exhaustive()
    }
}

fn api_error(secret: &SecretRef, err: kube::Error) -> BackendError {
    let secret = secret.to_string();
    match err {
        kube::Error::Api(response) if response.code == 429 || response.code >= 500 => {
            BackendError::Unavailable {
                secret,
                message: format!("{} ({})", response.message, response.code),
            }
        }
        kube::Error::Api(response) => BackendError::Api {
            secret,
            message: format!("{} ({})", response.message, response.code),
        },
        other => BackendError::Unavailable {
            secret,
            message: other.to_string(),
        },
    }
}

fn to_object(secret: &SecretRef, payload: SecretPayload) -> Secret {
    let data: BTreeMap<String, ByteString> = payload
        .data
        .into_iter()
        .map(|(key, value)| (key, ByteString(value)))
        .collect();

    Secret {
        metadata: ObjectMeta {
            name: Some(secret.name.clone()),
            namespace: Some(secret.namespace.clone()),
            ..Default::default()
        },
        type_: Some(payload.kind.as_type_str().to_string()),
        data: Some(data),
        ..Default::default()
    }
}

fn from_object(object: Secret) -> SecretPayload {
    let kind = match object.type_.as_deref() {
        Some("kubernetes.io/tls") => SecretKind::Tls,
        _ => SecretKind::Opaque,
    };
    let data = object
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| (key, value.0))
        .collect();

    SecretPayload { kind, data }
}

#[async_trait]
impl SecretBackend for KubeSecretBackend {
    async fn read(&self, secret: &SecretRef) -> Result<Option<SecretPayload>, BackendError> {
        let found = self
            .api(&secret.namespace)
            .get_opt(&secret.name)
            .await
            .map_err(|e| api_error(secret, e))?;

        trace!(secret = %secret, found = found.is_some(), "Fetched secret");
        Ok(found.map(from_object))
    }

    async fn write(&self, secret: &SecretRef, payload: SecretPayload) -> Result<(), BackendError> {
        let api = self.api(&secret.namespace);
        let mut object = to_object(secret, payload);
        let params = PostParams::default();

        let existing = api
            .get_opt(&secret.name)
            .await
            .map_err(|e| api_error(secret, e))?;

        if let Some(existing) = existing {
            debug!(secret = %secret, "Secret exists, replacing");
            // Keep labels, annotations and resourceVersion of the live object
            object.metadata = existing.metadata;
            api.replace(&secret.name, &params, &object)
                .await
                .map_err(|e| api_error(secret, e))?;
        } else {
            debug!(secret = %secret, "Secret does not exist, creating");
            api.create(&params, &object)
                .await
                .map_err(|e| api_error(secret, e))?;
        }

        Ok(())
    }
}
