//! Application activation settings
//!
//! The application KEK is stored wrapped under the Join Server's device KEK
//! and handed back in plaintext to callers allowed to read keys.

use super::JoinServer;
use crate::auth::{Authorizer, Context, Right};
use crate::error::{Error, Result};
use crate::registry::{ApplicationActivationSettings, SettingsField};

/// Touching the KEK additionally needs `keys`.
fn settings_rights(keys: Right, fields: &[SettingsField]) -> Vec<Right> {
    let mut rights = vec![Right::ApplicationSettingsBasic];
    if fields.contains(&SettingsField::Kek) {
        rights.push(keys);
    }
    rights
}

impl JoinServer {
    /// Settings of an application, `None` when there are none.
    pub(crate) async fn activation_settings(
        &self,
        application_id: &str,
    ) -> Result<Option<ApplicationActivationSettings>> {
        match self.app_activation.get_by_id(application_id).await {
            Ok(settings) => Ok(Some(settings)),
            Err(Error::ApplicationActivationSettingsNotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn get_application_activation_settings(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        application_id: &str,
        fields: &[SettingsField],
    ) -> Result<ApplicationActivationSettings> {
        let rights = settings_rights(Right::ApplicationDevicesReadKeys, fields);
        self.require_rights(ctx, authorizer, application_id, &rights)
            .await?;

        let stored = self.app_activation.get_by_id(application_id).await?;
        let mut settings = ApplicationActivationSettings::default();
        settings.apply_fields(&stored, fields);
        settings.kek = self.unwrap_at_rest(settings.kek.take()).await?;
        Ok(settings)
    }

    pub async fn set_application_activation_settings(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        application_id: &str,
        mut settings: ApplicationActivationSettings,
        fields: &[SettingsField],
    ) -> Result<ApplicationActivationSettings> {
        let rights = settings_rights(Right::ApplicationDevicesWriteKeys, fields);
        self.require_rights(ctx, authorizer, application_id, &rights)
            .await?;

        if fields.contains(&SettingsField::Kek) {
            settings.kek = self.wrap_at_rest(settings.kek.take()).await?;
        }

        let fields = fields.to_vec();
        let mut stored = self
            .app_activation
            .set_by_id(
                application_id,
                Box::new(move |stored| {
                    let mut next = stored.cloned().unwrap_or_default();
                    next.apply_fields(&settings, &fields);
                    // Application Servers resolve the AppSKey envelope by label.
                    let labelled = next.kek_label.as_deref().map_or(false, |l| !l.is_empty());
                    if next.kek.is_some() && !labelled {
                        return Err(Error::InvalidField(
                            "kek_label".to_string(),
                            "required when a KEK is set".to_string(),
                        ));
                    }
                    Ok((Some(settings), fields))
                }),
            )
            .await?
            .ok_or_else(|| Error::RegistryOperation("settings were not stored".to_string()))?;
        stored.kek = self.unwrap_at_rest(stored.kek.take()).await?;
        Ok(stored)
    }

    pub async fn delete_application_activation_settings(
        &self,
        ctx: &Context,
        authorizer: &Authorizer,
        application_id: &str,
    ) -> Result<()> {
        self.require_rights(
            ctx,
            authorizer,
            application_id,
            &[Right::ApplicationSettingsBasic],
        )
        .await?;

        self.app_activation
            .set_by_id(
                application_id,
                Box::new(|stored| match stored {
                    Some(_) => Ok((None, Vec::new())),
                    None => Err(Error::ApplicationActivationSettingsNotFound),
                }),
            )
            .await
            .map(|_| ())
    }
}
