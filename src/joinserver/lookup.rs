//! Session key and home network lookups.

use serde::{Deserialize, Serialize};

use super::JoinServer;
use crate::auth::{Authorizer, Context, Right};
use crate::error::{Error, Result};
use crate::lorawan::keys::{KeyEnvelope, SessionKeyId, StoredSessionKeys};
use crate::lorawan::{Eui64, NetId};
use crate::registry::EndDevice;

/// Identifies the session key record of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeyRequest {
    pub session_key_id: SessionKeyId,
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NwkSKeysResponse {
    pub f_nwk_s_int_key: KeyEnvelope,
    pub s_nwk_s_int_key: KeyEnvelope,
    pub nwk_s_enc_key: KeyEnvelope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSKeyResponse {
    pub app_s_key: KeyEnvelope,
}

/// Where a device's home Network Server lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeNetwork {
    pub net_id: NetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ns_id: Option<Eui64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_server_address: Option<String>,
}

impl JoinServer {
    /// Network session keys of a join, as stored. Cluster callers only.
    pub async fn get_nwk_s_keys(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        req: &SessionKeyRequest,
    ) -> Result<NwkSKeysResponse> {
        if !authorizer.is_cluster() {
            return Err(Error::PermissionDenied(
                "network session keys are only available within the cluster".to_string(),
            ));
        }
        authorizer.require_authorized(ctx).await?;

        Self::until(self.deadline(ctx), async {
            let keys = self.session_keys(req).await?.keys;
            Ok(NwkSKeysResponse {
                f_nwk_s_int_key: keys.f_nwk_s_int_key.ok_or(Error::NoFNwkSIntKey)?,
                s_nwk_s_int_key: keys.s_nwk_s_int_key.ok_or(Error::NoSNwkSIntKey)?,
                nwk_s_enc_key: keys.nwk_s_enc_key.ok_or(Error::NoNwkSEncKey)?,
            })
        })
        .await
    }

    /// AppSKey of a join, as stored.
    ///
    /// Interop callers must be the device's Application Server, identified
    /// by AS-ID when one is known and by address otherwise. Users need the
    /// right to read device keys.
    pub async fn get_app_s_key(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        req: &SessionKeyRequest,
    ) -> Result<AppSKeyResponse> {
        authorizer.require_authorized(ctx).await?;

        Self::until(self.deadline(ctx), async {
            match authorizer {
                Authorizer::Cluster { .. } => {}
                Authorizer::Interop => {
                    let dev = self.devices.get_by_eui(req.join_eui, req.dev_eui).await?;
                    self.require_application_server(ctx, authorizer, &dev)
                        .await?;
                }
                Authorizer::ApplicationRights { .. } => {
                    let dev = self.devices.get_by_eui(req.join_eui, req.dev_eui).await?;
                    authorizer
                        .require_application(
                            ctx,
                            &dev.ids.application_id,
                            &[Right::ApplicationDevicesReadKeys],
                        )
                        .await?;
                }
            }
            let keys = self.session_keys(req).await?.keys;
            Ok(AppSKeyResponse {
                app_s_key: keys.app_s_key.ok_or(Error::NoAppSKey)?,
            })
        })
        .await
    }

    /// Home network of a device, for roaming Network Servers.
    pub async fn get_home_network(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        join_eui: Eui64,
        dev_eui: Eui64,
    ) -> Result<HomeNetwork> {
        authorizer.require_authorized(ctx).await?;

        Self::until(self.deadline(ctx), async {
            let dev = self.devices.get_by_eui(join_eui, dev_eui).await?;
            if let Authorizer::ApplicationRights { .. } = authorizer {
                authorizer
                    .require_application(
                        ctx,
                        &dev.ids.application_id,
                        &[Right::ApplicationDevicesRead],
                    )
                    .await?;
            }
            let net_id = match dev.net_id {
                Some(net_id) => net_id,
                None => self
                    .activation_settings(&dev.ids.application_id)
                    .await?
                    .and_then(|s| s.home_net_id)
                    .ok_or(Error::NoNetId)?,
            };
            Ok(HomeNetwork {
                net_id,
                ns_id: dev.network_server_ns_id,
                tenant_id: dev.home_tenant_id,
                network_server_address: dev.network_server_address,
            })
        })
        .await
    }

    async fn session_keys(&self, req: &SessionKeyRequest) -> Result<StoredSessionKeys> {
        let record = self.keys.get_by_id(req.dev_eui, req.session_key_id).await?;
        if !req.join_eui.is_zero() && record.join_eui != req.join_eui {
            return Err(Error::SessionKeysNotFound);
        }
        Ok(record)
    }

    async fn require_application_server(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        dev: &EndDevice,
    ) -> Result<()> {
        let as_id = match &dev.application_server_id {
            Some(as_id) => Some(as_id.clone()),
            None => self
                .activation_settings(&dev.ids.application_id)
                .await?
                .and_then(|s| s.application_server_id),
        };
        match (as_id, &dev.application_server_address) {
            (Some(as_id), _) => authorizer.require_as_id(ctx, &as_id),
            (None, Some(address)) => authorizer.require_address(ctx, address),
            (None, None) => Err(Error::NoApplicationServerId),
        }
    }
}
