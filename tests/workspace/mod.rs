//! End-to-end workspace scenarios over an in-memory host.

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use snuggery_workspace::{MemoryHost, WorkspaceHandle, WorkspaceHost};

fn handle(host: &Arc<MemoryHost>, path: &str) -> WorkspaceHandle {
    WorkspaceHandle::new(Arc::clone(host) as Arc<dyn WorkspaceHost>, path)
        .expect("recognized file name")
}

#[tokio::test]
async fn nx_update_rewrites_only_the_changed_value() {
    let input = r#"{"version":2,"projects":{"all":{"root":"","targets":{"build":{"executor":"@x:glob","options":{"include":"*"}}}}}}"#;
    let host = Arc::new(MemoryHost::new().with_file("workspace.json", input));

    handle(&host, "workspace.json")
        .update(|workspace| {
            let project = workspace.projects().get("all").expect("project");
            let target = project.targets().get("build").expect("target");
            target.set_option("include", json!(["*"]))
        })
        .await
        .unwrap();

    assert_eq!(
        host.contents(Path::new("workspace.json")).unwrap(),
        r#"{"version":2,"projects":{"all":{"root":"","targets":{"build":{"executor":"@x:glob","options":{"include":["*"]}}}}}}"#
    );
}

#[tokio::test]
async fn structurally_equal_assignments_write_nothing() {
    let input = r#"{"version":2,"projects":{"all":{"root":"","targets":{"build":{"executor":"@x:glob","options":{"a":1,"b":2}}}}}}"#;
    let host = Arc::new(MemoryHost::new().with_file("workspace.json", input));

    handle(&host, "workspace.json")
        .update(|workspace| {
            let project = workspace.projects().get("all").expect("project");
            let target = project.targets().get("build").expect("target");
            // Same values, different identity.
            target.set_option("a", json!(1))?;
            target.set_builder("@x:glob")?;
            project.set_root("")?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(host.contents(Path::new("workspace.json")).unwrap(), input);
}

#[tokio::test]
async fn noop_updater_preserves_every_byte() {
    let input = "version: 1\n# hand written\nprojects:\n  app:\n    root: \"\"   # odd spacing kept\n";
    let host = Arc::new(MemoryHost::new().with_file("snuggery.yaml", input));

    handle(&host, "snuggery.yaml").update(|_| Ok(())).await.unwrap();

    assert_eq!(host.contents(Path::new("snuggery.yaml")).unwrap(), input);
}

#[tokio::test]
async fn json_comments_survive_edits() {
    let input = r#"{
  // workspace version
  "version": 1,
  "projects": {
    "app": {
      "root": "apps/app",
      "targets": {
        "build": {"builder": "@x:build", "options": {"verbose": false}}
      }
    }
  }
}
"#;
    let host = Arc::new(MemoryHost::new().with_file("angular.json", input));

    handle(&host, "angular.json")
        .update(|workspace| {
            let project = workspace.projects().get("app").expect("project");
            let target = project.targets().get("build").expect("target");
            target.set_option("verbose", json!(true))
        })
        .await
        .unwrap();

    let output = host.contents(Path::new("angular.json")).unwrap();
    assert!(output.contains("// workspace version"));
    assert!(output.contains(r#""verbose": true"#));
    assert!(!output.contains(r#""verbose": false"#));
}

#[tokio::test]
async fn angular_architect_documents_keep_their_key() {
    let input = r#"{
  "version": 1,
  "projects": {
    "app": {
      "root": "apps/app",
      "architect": {
        "build": {"builder": "@x:build", "options": {"verbose": false}}
      }
    }
  }
}
"#;
    let host = Arc::new(MemoryHost::new().with_file("angular.json", input));
    let workspace = handle(&host, "angular.json");

    // The uniform view always says `targets`.
    let uniform = workspace.read().await.unwrap();
    assert_eq!(
        uniform["projects"]["app"]["targets"]["build"]["builder"],
        json!("@x:build")
    );

    workspace
        .update(|workspace| {
            let project = workspace.projects().get("app").expect("project");
            let target = project.targets().get("build").expect("target");
            target.set_option("watch", json!(true))
        })
        .await
        .unwrap();

    let output = host.contents(Path::new("angular.json")).unwrap();
    assert!(output.contains("\"architect\""));
    assert!(!output.contains("\"targets\""));
    assert!(output.contains("\"watch\": true"));
}

#[tokio::test]
async fn yaml_alias_overrides_become_merge_keys() {
    let input = "version: 1
projects:
  app:
    root: \"\"
    targets:
      build:
        builder: \"@x:build\"
        options: &defaults {verbose: false}
      test:
        builder: \"@x:test\"
        options: *defaults
";
    let host = Arc::new(MemoryHost::new().with_file("snuggery.yaml", input));
    let workspace = handle(&host, "snuggery.yaml");

    workspace
        .update(|workspace| {
            let project = workspace.projects().get("app").expect("project");
            let target = project.targets().get("test").expect("target");
            target.set_option("added", json!(true))
        })
        .await
        .unwrap();

    let output = host.contents(Path::new("snuggery.yaml")).unwrap();
    // The shared anchor is untouched; the alias gained a local merge.
    assert!(output.contains("options: &defaults {verbose: false}"));
    assert!(output.contains("options: {<<: *defaults, added: true}"));

    let uniform = workspace.read().await.unwrap();
    assert_eq!(
        uniform["projects"]["app"]["targets"]["test"]["options"],
        json!({"verbose": false, "added": true})
    );
    assert_eq!(
        uniform["projects"]["app"]["targets"]["build"]["options"],
        json!({"verbose": false})
    );
}

const INHERITED_KDL: &str = r#"version 0
(abstract)project "base" {
    target "build" builder="@x:build" {
        options {
            verbose false
            cache true
        }
    }
}
project "child" extends="base" root="apps/child"
"#;

#[tokio::test]
async fn kdl_inherited_overrides_stay_local() {
    let host = Arc::new(MemoryHost::new().with_file("snuggery.kdl", INHERITED_KDL));
    let workspace = handle(&host, "snuggery.kdl");

    let uniform = workspace.read().await.unwrap();
    assert_eq!(
        uniform["projects"]["child"]["targets"]["build"]["options"]["verbose"],
        json!(false)
    );
    assert!(uniform["projects"].get("base").is_none());

    workspace
        .update(|workspace| {
            let project = workspace.projects().get("child").expect("project");
            let target = project.targets().get("build").expect("target");
            target.set_option("verbose", json!(true))
        })
        .await
        .unwrap();

    let output = host.contents(Path::new("snuggery.kdl")).unwrap();
    // The base definition still reads `verbose false`; only the child gained
    // a local override.
    assert!(output.contains("verbose false"));
    assert!(output.contains("verbose=true"));

    let uniform = workspace.read().await.unwrap();
    assert_eq!(
        uniform["projects"]["child"]["targets"]["build"]["options"],
        json!({"verbose": true, "cache": true})
    );
}

#[tokio::test]
async fn kdl_targets_can_be_added_to_inheriting_projects() {
    let host = Arc::new(MemoryHost::new().with_file("snuggery.kdl", INHERITED_KDL));
    let workspace = handle(&host, "snuggery.kdl");

    workspace
        .update(|workspace| {
            let project = workspace.projects().get("child").expect("project");
            project.targets().add("lint", json!({"builder": "@x:lint"}))?;
            Ok(())
        })
        .await
        .unwrap();

    let uniform = workspace.read().await.unwrap();
    assert_eq!(
        uniform["projects"]["child"]["targets"]["lint"],
        json!({"builder": "@x:lint"})
    );
    // The inherited target is still there.
    assert_eq!(
        uniform["projects"]["child"]["targets"]["build"]["builder"],
        json!("@x:build")
    );
}

#[tokio::test]
async fn kdl_cycles_are_configuration_errors() {
    let host = Arc::new(MemoryHost::new().with_file(
        "snuggery.kdl",
        "version 0\nproject \"a\" extends=\"b\" root=\"a\"\nproject \"b\" extends=\"a\" root=\"b\"\n",
    ));

    let err = handle(&host, "snuggery.kdl").read().await.unwrap_err();
    assert!(err.is_configuration_error());
    assert!(err.to_string().contains("a -> b -> a"));
}

#[tokio::test]
async fn native_handles_edit_files_on_disk() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("angular.json");
    tokio::fs::write(&path, r#"{"version":1,"projects":{"app":{"root":""}}}"#)
        .await
        .unwrap();

    let found = snuggery_workspace::find_workspace(
        &snuggery_workspace::NativeHost,
        &dir.path().join("apps/app"),
    )
    .await;
    assert_eq!(found, Some(path.clone()));

    let workspace = WorkspaceHandle::native(path.clone()).unwrap();
    workspace
        .update(|workspace| {
            let project = workspace.projects().get("app").expect("project");
            project.set_root("apps/app")
        })
        .await
        .unwrap();

    let output = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(output.contains(r#""root":"apps/app""#));
}

#[tokio::test]
async fn failed_updaters_leave_the_document_alone() {
    let input = r#"{"version":1,"projects":{"app":{"root":""}}}"#;
    let host = Arc::new(MemoryHost::new().with_file("snuggery.json", input));

    let result = handle(&host, "snuggery.json")
        .update(|workspace| {
            let project = workspace.projects().get("app").expect("project");
            project.set_root("moved")?;
            Err(snuggery_workspace::WorkspaceError::unsupported("abort"))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(host.contents(Path::new("snuggery.json")).unwrap(), input);
}
