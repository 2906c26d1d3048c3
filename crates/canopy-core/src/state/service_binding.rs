//! Service binding state machine

use super::Transition;
use crate::conditions::{is_stale, set_condition, Condition, ConditionStatus, READY};
use crate::crd::{
    CanopyApp, CanopyServiceBinding, CanopyServiceInstance, NamedRef, ServiceBindingStatus,
    BINDING_SECRET_AVAILABLE,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;

pub const REASON_INSTANCE_NOT_FOUND: &str = "ServiceInstanceNotFound";
pub const REASON_SECRET_NOT_FOUND: &str = "SecretNotFound";
pub const REASON_SECRET_FOUND: &str = "SecretFound";
pub const REASON_APP_NOT_FOUND: &str = "AppNotFound";

#[derive(Debug, Clone, Copy, Default)]
pub struct BindingObservation<'a> {
    pub app: Option<&'a CanopyApp>,
    pub instance: Option<&'a CanopyServiceInstance>,
    /// The instance's credentials secret
    pub secret: Option<&'a Secret>,
}

pub fn next_binding_status(
    binding: &CanopyServiceBinding,
    observed: &BindingObservation<'_>,
    now: DateTime<Utc>,
) -> Transition<ServiceBindingStatus> {
    if is_stale(binding) {
        return Transition::NoOp;
    }

    let generation = binding.metadata.generation;
    let mut status = binding.status.clone().unwrap_or_default();
    status.observed_generation = generation.unwrap_or_default();

    let secret_name = observed
        .instance
        .map(|i| i.spec.secret_name.as_str())
        .filter(|name| !name.is_empty());

    let (available, reason, message) = match (observed.instance, secret_name, observed.secret) {
        (None, _, _) => (
            ConditionStatus::False,
            REASON_INSTANCE_NOT_FOUND,
            format!("service instance {} not found", binding.spec.service.name),
        ),
        (Some(_), None, _) | (Some(_), Some(_), None) => (
            ConditionStatus::False,
            REASON_SECRET_NOT_FOUND,
            format!(
                "credentials secret {} of service instance {} not found",
                secret_name.unwrap_or("<unset>"),
                binding.spec.service.name
            ),
        ),
        (Some(_), Some(_), Some(_)) => (ConditionStatus::True, REASON_SECRET_FOUND, String::new()),
    };

    set_condition(
        &mut status.conditions,
        Condition::new(BINDING_SECRET_AVAILABLE, available, reason, message.clone(), generation, now),
    );
    status.binding = if available == ConditionStatus::True {
        secret_name.map(NamedRef::new)
    } else {
        None
    };

    let ready = if observed.app.is_none() {
        Condition::new(
            READY,
            ConditionStatus::False,
            REASON_APP_NOT_FOUND,
            format!("app {} not found", binding.spec.app_ref.name),
            generation,
            now,
        )
    } else if available == ConditionStatus::True {
        Condition::new(READY, ConditionStatus::True, "BindingReady", "", generation, now)
    } else {
        Condition::new(READY, ConditionStatus::False, reason, message, generation, now)
    };
    set_condition(&mut status.conditions, ready);

    Transition::changed(binding.status.as_ref(), status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::find_condition;
    use crate::crd::{
        CanopyAppSpec, CanopyServiceBindingSpec, CanopyServiceInstanceSpec, DesiredState,
        Lifecycle,
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn binding() -> CanopyServiceBinding {
        let mut binding = CanopyServiceBinding::new(
            "binding-1",
            CanopyServiceBindingSpec {
                display_name: None,
                service: NamedRef::new("instance-1"),
                app_ref: NamedRef::new("app-1"),
            },
        );
        binding.metadata.generation = Some(1);
        binding
    }

    fn instance(secret: &str) -> CanopyServiceInstance {
        CanopyServiceInstance::new(
            "instance-1",
            CanopyServiceInstanceSpec {
                display_name: "db".to_string(),
                secret_name: secret.to_string(),
                r#type: "user-provided".to_string(),
                tags: vec![],
            },
        )
    }

    fn app() -> CanopyApp {
        CanopyApp::new(
            "app-1",
            CanopyAppSpec {
                display_name: "app".to_string(),
                desired_state: DesiredState::Stopped,
                current_droplet_ref: None,
                lifecycle: Lifecycle::default(),
                env_secret_name: None,
            },
        )
    }

    #[test]
    fn test_missing_instance() {
        let app = app();
        let status = next_binding_status(
            &binding(),
            &BindingObservation {
                app: Some(&app),
                ..Default::default()
            },
            now(),
        )
        .into_update()
        .unwrap();
        let available = find_condition(&status.conditions, BINDING_SECRET_AVAILABLE).unwrap();
        assert_eq!(available.reason, REASON_INSTANCE_NOT_FOUND);
        assert_eq!(find_condition(&status.conditions, READY).unwrap().status, ConditionStatus::False);
        assert!(status.binding.is_none());
    }

    #[test]
    fn test_missing_secret() {
        let (app, instance) = (app(), instance("creds"));
        let status = next_binding_status(
            &binding(),
            &BindingObservation {
                app: Some(&app),
                instance: Some(&instance),
                secret: None,
            },
            now(),
        )
        .into_update()
        .unwrap();
        let available = find_condition(&status.conditions, BINDING_SECRET_AVAILABLE).unwrap();
        assert_eq!(available.reason, REASON_SECRET_NOT_FOUND);
        assert!(available.message.contains("creds"));
    }

    #[test]
    fn test_bound() {
        let (app, instance) = (app(), instance("creds"));
        let secret = Secret::default();
        let mut binding = binding();
        let observed = BindingObservation {
            app: Some(&app),
            instance: Some(&instance),
            secret: Some(&secret),
        };
        let status = next_binding_status(&binding, &observed, now()).into_update().unwrap();
        assert_eq!(
            find_condition(&status.conditions, BINDING_SECRET_AVAILABLE).unwrap().reason,
            REASON_SECRET_FOUND
        );
        assert!(find_condition(&status.conditions, READY).unwrap().is_true());
        assert_eq!(status.binding, Some(NamedRef::new("creds")));

        binding.status = Some(status);
        assert!(next_binding_status(&binding, &observed, now()).is_noop());
    }
}
