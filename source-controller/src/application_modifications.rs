use crate::{client::WorkloadClient, errors::ControllerError};
use json_patch::diff;
use source_controller_apis::Application;
use std::ops::DerefMut;

/// Helper construct to track modifications of an [`Application`] read from the
/// cache and to report its status sub-resource.
pub(crate) struct ApplicationModifications {
    original: Application,
    pub modified: Application,
}

impl std::ops::Deref for ApplicationModifications {
    type Target = Application;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl DerefMut for ApplicationModifications {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

impl ApplicationModifications {
    pub(crate) fn new(original: Application) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    fn status_has_changed(&self) -> Result<bool, ControllerError> {
        Ok(self.get_status_patch(&self.original)?.is_some())
    }

    fn get_status_patch(
        &self,
        latest: &Application,
    ) -> Result<Option<json_patch::Patch>, ControllerError> {
        let patch = diff(
            &serde_json::to_value(&latest.status)?,
            &serde_json::to_value(&self.modified.status)?,
        );
        if patch.0.is_empty() {
            Ok(None)
        } else {
            Ok(Some(patch))
        }
    }

    /// Replace the status sub-resource with the modified status. Only the status
    /// is sent, spec changes made by the Application's author are never
    /// overwritten. No API call is made if the status did not change.
    ///
    /// Returns whether the status was written.
    pub(crate) async fn replace_status(
        &mut self,
        client: &dyn WorkloadClient,
    ) -> Result<bool, ControllerError> {
        if !self.status_has_changed()? {
            debug!("status of Application {} is up to date", self.id());
            return Ok(false);
        }
        let mut update = self.original.clone();
        update.status = self.modified.status.clone();
        self.modified = client.update_application_status(&update).await?;
        self.original = self.modified.clone();
        debug!("updated status of Application {}", self.versioned_id());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Action, RecordingClient, new_application};
    use source_controller_apis::ApplicationStatus;

    #[tokio::test]
    async fn skips_unchanged_status() {
        let client = RecordingClient::default();
        let mut application = new_application("test", Some(1));
        application.update_available_replicas(1);
        let mut modifications = ApplicationModifications::new(application);
        modifications.update_available_replicas(1);
        assert!(!modifications.replace_status(&client).await.unwrap());
        assert!(client.actions().is_empty());
    }

    #[tokio::test]
    async fn replaces_changed_status_only() {
        let client = RecordingClient::default();
        let application = new_application("test", Some(1));
        let mut modifications = ApplicationModifications::new(application.clone());
        modifications.update_available_replicas(0);
        // Spec changes are never part of a status update.
        modifications.spec.replicas = Some(7);
        assert!(modifications.replace_status(&client).await.unwrap());

        let mut expected = application.clone();
        expected.status = Some(ApplicationStatus {
            available_replicas: 0,
        });
        assert_eq!(
            vec![Action::UpdateApplicationStatus(expected)],
            client.actions()
        );
        // Nothing left to report.
        assert!(!modifications.replace_status(&client).await.unwrap());
        assert_eq!(1, client.actions().len());
    }
}
