//! Hot updates through a dev session.

mod common;

use common::{config, context, project, write};
use sluice_core::DevSession;
use sluice_proto::HmrMessage;

#[test]
fn test_leaf_change_touches_only_its_chunk() {
    let dir = project(&[
        ("src/main.js", b"import { util } from './util';\nutil();\n"),
        ("src/util.js", b"export function util() {}\n"),
        ("src/admin.js", b"console.log('admin');\n"),
    ]);
    let ctx = context(
        dir.path(),
        config(&[("main", "src/main.js"), ("admin", "src/admin.js")]),
    );
    let session = DevSession::new(ctx).unwrap();
    let before = session.chunk_hashes();

    let admin = dir.path().join("src/admin.js");
    write(dir.path(), "src/admin.js", b"console.log('admin v2');\n");
    let message = session.file_changed(&[admin.clone()]).unwrap();

    let admin_id = session.module_id(&admin).unwrap();
    let HmrMessage::Update {
        changed_module_ids,
        chunk_hashes,
    } = message
    else {
        panic!("expected an update, got {message:?}");
    };
    assert_eq!(changed_module_ids, vec![admin_id]);
    assert_eq!(chunk_hashes.keys().collect::<Vec<_>>(), vec!["admin"]);

    let after = session.chunk_hashes();
    assert_eq!(before["main"], after["main"]);
    assert_ne!(before["admin"], after["admin"]);
}

#[test]
fn test_update_serializes_to_wire_format() {
    let dir = project(&[("src/main.js", b"console.log(1);\n")]);
    let session = DevSession::new(context(dir.path(), config(&[("main", "src/main.js")]))).unwrap();

    let main = dir.path().join("src/main.js");
    let main_id = session.module_id(&main).unwrap();
    write(dir.path(), "src/main.js", b"console.log(2);\n");
    let message = session.file_changed(&[main]).unwrap();
    let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

    assert_eq!(json["type"], "update");
    assert_eq!(json["changedModuleIds"], serde_json::json!([main_id]));
    assert!(json["chunkHashes"]["main"].is_string());
}

#[test]
fn test_served_chunk_matches_update() {
    let dir = project(&[("src/main.js", b"console.log('before');\n")]);
    let session = DevSession::new(context(dir.path(), config(&[("main", "src/main.js")]))).unwrap();

    let main = dir.path().join("src/main.js");
    write(dir.path(), "src/main.js", b"console.log('after');\n");
    assert!(session.file_changed(&[main]).is_some());

    let source = String::from_utf8(session.chunk_source("main", "js").unwrap()).unwrap();
    assert!(source.contains("console.log('after')"));
    let hash = blake3::hash(source.as_bytes()).to_hex().to_string();
    assert_eq!(session.chunk_hashes()["main"], hash);
}

#[test]
fn test_config_edit_pushes_reload() {
    let dir = project(&[
        ("src/main.js", b"console.log('main');\n"),
        ("src/admin.js", b"console.log('admin');\n"),
    ]);
    let session = DevSession::new(context(dir.path(), config(&[("main", "src/main.js")]))).unwrap();
    assert!(session.chunk_source("admin", "js").is_none());

    write(
        dir.path(),
        "sluice.config.json",
        br#"{ "entry": { "main": "src/main.js", "admin": "src/admin.js" } }"#,
    );
    let message = session
        .file_changed(&[dir.path().join("sluice.config.json")])
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

    assert_eq!(json, serde_json::json!({ "type": "reload" }));
    assert!(session.chunk_source("admin", "js").is_some());
    assert_eq!(session.chunk_hashes().len(), 2);
}
