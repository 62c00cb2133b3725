use std::time::Duration;

use duroflow::{
    ActivityRegistry, ConfigErrorKind, ErrorDetails, InstanceStatus, OrchestrationContext, OrchestrationRegistry,
    StartOptions, VersionPolicy,
};

mod common;
use common::Harness;

fn versioned(policy: Option<VersionPolicy>) -> OrchestrationRegistry {
    let mut builder = OrchestrationRegistry::builder()
        .register_versioned("Flow", "1.0.0", |ctx: OrchestrationContext, _input: String| async move {
            Ok(format!("v1:{}", ctx.version()))
        })
        .register_versioned("Flow", "2.0.0", |ctx: OrchestrationContext, _input: String| async move {
            Ok(format!("v2:{}", ctx.version()))
        });
    if let Some(policy) = policy {
        builder = builder.set_policy("Flow", policy);
    }
    builder.build()
}

#[tokio::test]
async fn latest_version_is_picked_by_default() {
    let h = Harness::start(ActivityRegistry::builder().build(), versioned(None)).await;
    let info = h.run("Flow", "ver-1", "").await;
    assert_eq!(info.output.as_deref(), Some("v2:2.0.0"));
    assert_eq!(info.version, "2.0.0");
    h.shutdown().await;
}

#[tokio::test]
async fn exact_policy_and_explicit_pin() {
    let policy = VersionPolicy::Exact(semver::Version::new(1, 0, 0));
    let h = Harness::start(ActivityRegistry::builder().build(), versioned(Some(policy))).await;
    let info = h.run("Flow", "ver-2", "").await;
    assert_eq!(info.output.as_deref(), Some("v1:1.0.0"));

    h.client
        .start_workflow_with(
            "Flow",
            "",
            StartOptions::new().with_instance_id("ver-3").with_version("2.0.0"),
        )
        .await
        .unwrap();
    let pinned = h
        .client
        .wait_for_completion("ver-3", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(pinned.output.as_deref(), Some("v2:2.0.0"));
    h.shutdown().await;
}

#[tokio::test]
async fn unknown_pinned_version_fails() {
    let h = Harness::start(ActivityRegistry::builder().build(), versioned(None)).await;
    h.client
        .start_workflow_with(
            "Flow",
            "",
            StartOptions::new().with_instance_id("ver-4").with_version("9.9.9"),
        )
        .await
        .unwrap();
    let info = h
        .client
        .wait_for_completion("ver-4", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(info.status, InstanceStatus::Failed);
    assert!(matches!(
        info.failure,
        Some(ErrorDetails::Configuration {
            kind: ConfigErrorKind::UnregisteredOrchestration,
            ..
        })
    ));
    h.shutdown().await;
}
