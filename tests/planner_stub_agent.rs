//! Planner adapter tests against stub agent binaries: every response shape
//! must canonicalize to the same plan, timeouts must kill the subprocess,
//! and unknown tool servers must be rejected.
#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nightshift::agent::planner::{Planner, DEFAULT_PLAN_TIMEOUT};
use nightshift::config::{Paths, Settings};
use nightshift::core::toolconf::{ServerSpec, ToolConfigManager};
use nightshift::error::NightshiftError;
use nightshift::task::model::Plan;

fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt as _;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write stub");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

fn echo_stub(dir: &Path, name: &str, payload: &str) -> PathBuf {
    write_stub(dir, name, &format!("cat <<'NIGHTSHIFT_STUB_EOF'\n{payload}\nNIGHTSHIFT_STUB_EOF\n"))
}

fn canonical_plan() -> serde_json::Value {
    serde_json::json!({
        "enhanced_prompt": "Write a haiku about dusk to haiku.md in the working directory",
        "allowed_tools": ["Write", "ext__arxiv__search"],
        "allowed_directories": ["/work/poems"],
        "needs_git": false,
        "system_prompt": "Work only inside the allowed directories.",
        "estimated_tokens": 500,
        "estimated_time": 30
    })
}

fn registry() -> ToolConfigManager {
    let mut servers = BTreeMap::new();
    servers.insert(
        "arxiv".to_owned(),
        ServerSpec {
            command: "arxiv-server".to_owned(),
            args: vec!["--stdio".to_owned()],
            env: BTreeMap::new(),
        },
    );
    ToolConfigManager::from_servers(servers)
}

fn planner_for(agent_bin: &Path, base_dir: &Path) -> Planner {
    let paths = Paths::new(Some(base_dir.to_path_buf())).expect("paths");
    let mut settings = Settings::default();
    settings.agent_bin = agent_bin.to_string_lossy().to_string();
    Planner::new(&settings, &paths, registry())
}

#[tokio::test]
async fn all_three_response_shapes_yield_the_same_plan() {
    if std::process::Command::new("/bin/sh").arg("-c").arg("true").output().is_err() {
        eprintln!("skipping: /bin/sh not available");
        return;
    }
    let td = tempfile::tempdir().expect("tempdir");
    let plan_json = canonical_plan();

    let wrapped = serde_json::json!({ "structured_output": plan_json });
    let stringly = serde_json::json!({ "result": serde_json::to_string(&plan_json).unwrap() });
    let fenced = serde_json::json!({
        "result": format!("```json\n{}\n```", serde_json::to_string_pretty(&plan_json).unwrap())
    });

    let mut plans: Vec<Plan> = Vec::new();
    for (name, payload) in [
        ("agent_structured", serde_json::to_string(&wrapped).unwrap()),
        ("agent_result", serde_json::to_string(&stringly).unwrap()),
        ("agent_fenced", serde_json::to_string(&fenced).unwrap()),
        ("agent_bare", serde_json::to_string(&plan_json).unwrap()),
    ] {
        let stub = echo_stub(td.path(), name, &payload);
        let planner = planner_for(&stub, &td.path().join(name).with_extension("data"));
        let plan = planner
            .plan("write a haiku about dusk", DEFAULT_PLAN_TIMEOUT)
            .await
            .unwrap_or_else(|e| panic!("{name}: {e}"));
        plans.push(plan);
    }

    for plan in &plans[1..] {
        assert_eq!(plan, &plans[0]);
    }
    assert_eq!(plans[0].allowed_directories, vec!["/work/poems"]);
    assert_eq!(plans[0].estimated_tokens, Some(500));
}

#[tokio::test]
async fn planner_timeout_kills_the_subprocess() {
    let td = tempfile::tempdir().expect("tempdir");
    let stub = write_stub(td.path(), "agent_slow", "sleep 5\n");
    let planner = planner_for(&stub, &td.path().join("data"));

    let started = std::time::Instant::now();
    let err = planner
        .plan("anything", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<NightshiftError>(),
        Some(NightshiftError::PlannerTimeout(1))
    ));
    assert!(started.elapsed() < Duration::from_secs(4), "subprocess was killed");
}

#[tokio::test]
async fn unknown_tool_server_is_rejected() {
    let td = tempfile::tempdir().expect("tempdir");
    let mut plan_json = canonical_plan();
    plan_json["allowed_tools"] = serde_json::json!(["ext__nonexistent__lookup"]);
    let stub = echo_stub(
        td.path(),
        "agent_unknown",
        &serde_json::to_string(&plan_json).unwrap(),
    );
    let planner = planner_for(&stub, &td.path().join("data"));

    let err = planner
        .plan("anything", DEFAULT_PLAN_TIMEOUT)
        .await
        .unwrap_err();
    match err.downcast_ref::<NightshiftError>() {
        Some(NightshiftError::UnknownTool(server)) => assert_eq!(server, "nonexistent"),
        other => panic!("expected UnknownTool, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_required_field_is_an_invalid_plan() {
    let td = tempfile::tempdir().expect("tempdir");
    let mut plan_json = canonical_plan();
    plan_json.as_object_mut().unwrap().remove("allowed_directories");
    let stub = echo_stub(
        td.path(),
        "agent_invalid",
        &serde_json::to_string(&plan_json).unwrap(),
    );
    let planner = planner_for(&stub, &td.path().join("data"));

    let err = planner
        .plan("anything", DEFAULT_PLAN_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<NightshiftError>(),
        Some(NightshiftError::InvalidPlan(_))
    ));
}

#[tokio::test]
async fn nonzero_planner_exit_surfaces_stderr() {
    let td = tempfile::tempdir().expect("tempdir");
    let stub = write_stub(td.path(), "agent_broken", "echo 'model overloaded' >&2\nexit 3\n");
    let planner = planner_for(&stub, &td.path().join("data"));

    let err = planner
        .plan("anything", DEFAULT_PLAN_TIMEOUT)
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("model overloaded"), "got: {msg}");
}
