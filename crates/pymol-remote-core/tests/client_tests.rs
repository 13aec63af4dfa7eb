//! Session behaviour against a live server around the fake scene.

mod common;

use common::{raw_rpc, spawn_scene_server};
use pymol_remote::{
    CallArgs, ConnectionCache, GetStateRequest, PymolRemoteError, Session, SessionOptions,
    SetStateRequest, StateBlob, StateFormat,
};
use serde_json::json;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn options(port: u16) -> SessionOptions {
    SessionOptions::new("127.0.0.1", port)
}

#[tokio::test]
async fn test_unreachable_endpoint_is_connection_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let cache = ConnectionCache::new();

    let err = Session::connect(&cache, options(port)).await.unwrap_err();

    assert!(matches!(err, PymolRemoteError::Connection { .. }));
    assert!(err
        .to_string()
        .contains("Error connecting to PyMOL RPC server"));
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn test_silent_listener_times_out() {
    // Accepted by the kernel backlog, never answered.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let cache = ConnectionCache::new();

    let started = Instant::now();
    let err = Session::connect(&cache, options(port).timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(3));
    match err {
        PymolRemoteError::Timeout { timeout, .. } => {
            assert_eq!(timeout, Duration::from_millis(100))
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    drop(listener);
}

#[tokio::test]
async fn test_connection_reuse_and_force_new() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();

    let first = Session::connect(&cache, options(server.port())).await.unwrap();
    let second = Session::connect(&cache, options(server.port())).await.unwrap();
    assert!(Arc::ptr_eq(first.connection(), second.connection()));

    let fresh = Session::connect(&cache, options(server.port()).force_new(true))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(first.connection(), fresh.connection()));

    let cached = cache.get("127.0.0.1", server.port()).await.unwrap();
    assert!(Arc::ptr_eq(&cached, fresh.connection()));
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn test_session_display() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();

    assert_eq!(
        session.to_string(),
        format!("PymolSession(hostname=\"127.0.0.1\", port={})", server.port())
    );
}

#[tokio::test]
async fn test_invoke_registered_commands() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();

    let object = session
        .invoke("fetch", CallArgs::new().arg("1YCR"))
        .await
        .unwrap();
    assert_eq!(object, json!("1ycr"));

    let names = session.invoke("get_names", CallArgs::new()).await.unwrap();
    assert_eq!(names, json!(["1ycr"]));

    // Mixed positional and keyword arguments travel packed.
    session
        .invoke("color", CallArgs::new().arg("red").kwarg("selection", "1ycr"))
        .await
        .unwrap();
    assert_eq!(server.host.scene().colors["1ycr"], "red");
}

#[tokio::test]
async fn test_remote_command_handle() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();

    let fetch = session.command("fetch").await.unwrap();
    assert_eq!(fetch.name(), "fetch");
    fetch.call(CallArgs::new().arg("1ycr")).await.unwrap();
    fetch
        .call(CallArgs::new().arg("4hhb").kwarg("name", "hemoglobin"))
        .await
        .unwrap();

    assert_eq!(server.host.scene().objects, vec!["1ycr", "hemoglobin"]);
}

#[tokio::test]
async fn test_unknown_command_suggests_alternatives() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();

    let err = session
        .invoke("fetc", CallArgs::new().arg("1ycr"))
        .await
        .unwrap_err();

    match &err {
        PymolRemoteError::CommandNotFound { name, suggestions } => {
            assert_eq!(name, "fetc");
            assert_eq!(suggestions, &vec!["fetch", "prefetch_all"]);
        }
        other => panic!("expected command-not-found, got {other:?}"),
    }
    assert!(err.to_string().contains("Did you mean one of: fetch, prefetch_all?"));
    assert!(server.host.scene().objects.is_empty());
}

#[tokio::test]
async fn test_find_command() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();

    assert_eq!(
        session.find_command("fetc").await.unwrap(),
        vec!["fetch", "prefetch_all"]
    );
    assert_eq!(
        session.find_command("GETN").await.unwrap(),
        vec!["get_names"]
    );
    assert!(session.find_command("zzz").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_is_alive_falls_back_to_plain_params() {
    let server = spawn_scene_server().await;

    // The packed form is a calling-convention mismatch for `is_alive`...
    let packed = raw_rpc(server.port(), "is_alive", Some(json!([[], {}]))).await;
    assert_eq!(packed["error"]["code"], json!(-32602));

    // ...which the session recovers from.
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();
    assert!(session.is_alive().await.unwrap());
}

#[tokio::test]
async fn test_host_failure_is_not_retried() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();

    let err = session
        .invoke("fetch", CallArgs::new().arg("not-a-code"))
        .await
        .unwrap_err();

    match err {
        PymolRemoteError::Remote { method, code, message } => {
            assert_eq!(method, "fetch");
            assert_eq!(code, -32000);
            assert!(message.contains("no PDB entry"));
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_python_is_wrapped_in_block() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();

    session.python("print(cmd.get_names())").await.unwrap();
    session.do_command("zoom").await.unwrap();

    assert_eq!(
        server.host.scene().history,
        vec!["python\nprint(cmd.get_names())\npython end", "zoom"]
    );
}

#[tokio::test]
async fn test_help() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();

    let listing = session.help(None).await.unwrap();
    assert!(listing.contains("\n  - fetch"));
    assert!(listing.contains("\n  - get_state"));
    assert!(!listing.contains("Color"));
    assert!(!listing.contains("system."));

    let fetch = session.help(Some("fetch")).await.unwrap();
    assert_eq!(
        fetch,
        "fetch(code, name='', state=0)\nRetrieve a structure from the PDB."
    );

    let custom = session.help(Some("set_state")).await.unwrap();
    assert!(custom.starts_with("set_state(buffer, object='', state=0, format='pse')\n"));

    assert_eq!(
        session.help(Some("nope")).await.unwrap(),
        "Command Not Found"
    );
}

#[tokio::test]
async fn test_unsupported_format_touches_nothing() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();

    let err = session
        .invoke("get_state", CallArgs::new().kwarg("format", "xyz"))
        .await
        .unwrap_err();

    match err {
        PymolRemoteError::Remote { code, message, .. } => {
            assert_eq!(code, -32005);
            assert!(message.contains("Format `xyz` not supported"));
            assert!(message.contains("pdb, cif, mol, sdf, png, pkl, pse"));
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert_eq!(server.host.scene().saves, 0);
    assert_eq!(server.temp_files(), 0);
}

#[tokio::test]
async fn test_text_state_round_trip() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();

    for format in StateFormat::TEXT {
        session
            .invoke("fetch", CallArgs::new().arg("1ycr"))
            .await
            .unwrap();
        let saved = session
            .get_state(&GetStateRequest {
                format,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(saved, StateBlob::Text("OBJECT 1ycr\n".to_string()), "{format}");

        session
            .invoke("reinitialize", CallArgs::new())
            .await
            .unwrap();
        assert!(server.host.scene().objects.is_empty());

        session
            .set_state(
                &saved,
                &SetStateRequest {
                    format: format.to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(server.host.scene().objects, vec!["1ycr"], "{format}");
        assert_eq!(server.temp_files(), 0);
    }
    assert_eq!(
        server.host.scene().loaded_formats,
        vec!["pdb", "cif", "mol", "sdf"]
    );
}

#[tokio::test]
async fn test_set_state_loads_any_extension() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();

    session
        .set_state(
            &StateBlob::Text("OBJECT ligand\n".to_string()),
            &SetStateRequest {
                format: "mol2".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(server.host.scene().objects, vec!["ligand"]);
    assert_eq!(server.host.scene().loaded_formats, vec!["mol2"]);
    assert_eq!(server.temp_files(), 0);

    let err = session
        .set_state(
            &StateBlob::Text("OBJECT x\n".to_string()),
            &SetStateRequest {
                format: "../mol2".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PymolRemoteError::Remote { code: -32005, .. }));
    assert_eq!(server.host.scene().loads, 1);
}

#[tokio::test]
async fn test_session_state_round_trip() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let session = Session::connect(&cache, options(server.port())).await.unwrap();

    session
        .invoke("fetch", CallArgs::new().arg("1ycr"))
        .await
        .unwrap();
    session
        .invoke("fetch", CallArgs::new().arg("4hhb"))
        .await
        .unwrap();
    session
        .invoke("color", CallArgs::new().arg("blue"))
        .await
        .unwrap();
    let before = server.host.scene();

    let pse = session
        .get_state(&GetStateRequest {
            format: StateFormat::Pse,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(matches!(pse, StateBlob::Binary(_)));
    assert!(pse.as_bytes().starts_with(b"PSE\0"));

    session
        .invoke("reinitialize", CallArgs::new())
        .await
        .unwrap();
    session
        .set_state(&pse, &SetStateRequest::default())
        .await
        .unwrap();

    let after = server.host.scene();
    assert_eq!(after.objects, before.objects);
    assert_eq!(after.colors, before.colors);
    assert_eq!(server.temp_files(), 0);
}

#[tokio::test]
async fn test_call_timeout_bounds_later_calls() {
    let server = spawn_scene_server().await;
    let cache = ConnectionCache::new();
    let call_timeout = Duration::from_millis(300);
    let session = Session::connect(&cache, options(server.port()).call_timeout(call_timeout))
        .await
        .unwrap();

    session
        .invoke("sleep", CallArgs::new().arg(10))
        .await
        .unwrap();

    let started = Instant::now();
    let err = session
        .invoke("sleep", CallArgs::new().arg(2_000))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(1_500));
    match err {
        PymolRemoteError::Timeout { timeout, .. } => assert_eq!(timeout, call_timeout),
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_rpc_http_service_is_connection_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, axum::Router::new()).await.unwrap();
    });
    let cache = ConnectionCache::new();

    let err = Session::connect(&cache, options(port)).await.unwrap_err();

    assert!(matches!(err, PymolRemoteError::Connection { .. }), "{err:?}");
    let message = err.to_string();
    assert!(message.contains("Error connecting to PyMOL RPC server"));
    assert!(message.contains("404"));
    assert!(cache.is_empty().await);
}
