//! Basic tests for real-time collaboration over one instance.

use anyhow::Result;
use coedit_server::permission::Role;
use common::*;
use serde_json::json;

pub mod common;

#[tokio::test]
async fn test_join_receives_document_state() -> Result<()> {
    logging();
    let server = TestServer::start().await?;
    let token = server.seed_user("alice").await;
    server.seed_document("notes", "alice", "hello").await;

    let (_socket, state) = join_document(&server, &token, "notes").await?;
    assert_eq!(state["id"], "notes");
    assert_eq!(state["content"], "hello");
    assert_eq!(state["version"], 1);
    assert_eq!(state["owner"], "alice");
    assert_eq!(state["role"], "owner");
    let active = state["activeUsers"].as_array().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["userId"], "alice");
    Ok(())
}

#[tokio::test]
async fn test_single_operation() -> Result<()> {
    logging();
    let server = TestServer::start().await?;
    let token = server.seed_user("alice").await;
    server.seed_document("notes", "alice", "").await;

    let (mut socket, _) = join_document(&server, &token, "notes").await?;
    socket
        .send(&json!({
            "event": "operation",
            "operation": { "type": "insert", "position": 0, "text": "hello", "baseVersion": 1 }
        }))
        .await;

    let ack = socket.recv().await?;
    assert_eq!(
        ack,
        json!({
            "event": "operation_ack",
            "operation": { "type": "insert", "position": 0, "text": "hello", "baseVersion": 1 },
            "version": 2,
            "userId": "alice"
        })
    );

    server.expect_text("notes", "hello").await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_insert_transform() -> Result<()> {
    logging();
    let server = TestServer::start().await?;
    let alice = server.seed_user("alice").await;
    let bob = server.seed_user("bob").await;
    server.seed_document("notes", "alice", "AC").await;
    server.share("notes", "bob", Role::Editor).await;

    let (mut alice_socket, _) = join_document(&server, &alice, "notes").await?;
    let (mut bob_socket, _) = join_document(&server, &bob, "notes").await?;
    // Alice sees Bob arrive.
    let joined = alice_socket.recv().await?;
    assert_eq!(joined["event"], "user_joined");

    // Alice's insert is accepted first.
    alice_socket
        .send(&json!({
            "event": "operation",
            "operation": { "type": "insert", "position": 1, "text": "B", "baseVersion": 1 }
        }))
        .await;
    let ack = alice_socket.recv().await?;
    assert_eq!(ack["event"], "operation_ack");
    assert_eq!(ack["version"], 2);

    // Bob edits against the same base before seeing Alice's change; the
    // server shifts his insert right.
    bob_socket
        .send(&json!({
            "event": "operation",
            "operation": { "type": "insert", "position": 1, "text": "X", "baseVersion": 1 }
        }))
        .await;

    let remote = bob_socket.recv().await?;
    assert_eq!(remote["event"], "remote_operation");
    assert_eq!(remote["version"], 2);
    assert_eq!(remote["userId"], "alice");

    let ack = bob_socket.recv().await?;
    assert_eq!(
        ack,
        json!({
            "event": "operation_ack",
            "operation": { "type": "insert", "position": 2, "text": "X", "baseVersion": 1 },
            "version": 3,
            "userId": "bob"
        })
    );

    let remote = alice_socket.recv().await?;
    assert_eq!(remote["event"], "remote_operation");
    assert_eq!(remote["operation"]["position"], 2);
    assert_eq!(remote["version"], 3);
    assert_eq!(remote["username"], "bob");

    server.expect_text("notes", "ABXC").await;
    Ok(())
}

#[tokio::test]
async fn test_overlapping_deletes_ack_as_noop() -> Result<()> {
    logging();
    let server = TestServer::start().await?;
    let token = server.seed_user("alice").await;
    server.seed_document("notes", "alice", "ABCDE").await;

    let (mut socket, _) = join_document(&server, &token, "notes").await?;
    socket
        .send(&json!({
            "event": "operation",
            "operation": { "type": "delete", "position": 1, "length": 3, "baseVersion": 1 }
        }))
        .await;
    let ack = socket.recv().await?;
    assert_eq!(ack["version"], 2);

    // A concurrent delete fully covered by the first collapses; the version
    // does not advance.
    socket
        .send(&json!({
            "event": "operation",
            "operation": { "type": "delete", "position": 2, "length": 2, "baseVersion": 1 }
        }))
        .await;
    let ack = socket.recv().await?;
    assert_eq!(
        ack,
        json!({
            "event": "operation_ack",
            "operation": { "type": "noop" },
            "version": 2,
            "userId": "alice"
        })
    );

    server.expect_text("notes", "AE").await;
    Ok(())
}

#[tokio::test]
async fn test_errors_keep_the_session_usable() -> Result<()> {
    logging();
    let server = TestServer::start().await?;
    let token = server.seed_user("alice").await;
    server.seed_document("notes", "alice", "").await;

    let (mut socket, _) = join_document(&server, &token, "notes").await?;

    // Unknown event name.
    socket.send(&json!({ "event": "upload_image" })).await;
    let err = socket.recv().await?;
    assert_eq!(err["event"], "error_message");

    // Empty insert text fails validation.
    socket
        .send(&json!({
            "event": "operation",
            "operation": { "type": "insert", "position": 0, "text": "", "baseVersion": 1 }
        }))
        .await;
    let err = socket.recv().await?;
    assert_eq!(err["event"], "error_message");

    // Base version ahead of the document.
    socket
        .send(&json!({
            "event": "operation",
            "operation": { "type": "insert", "position": 0, "text": "x", "baseVersion": 42 }
        }))
        .await;
    let err = socket.recv().await?;
    assert_eq!(err["event"], "error_message");

    // The connection is still good for a valid edit.
    socket
        .send(&json!({
            "event": "operation",
            "operation": { "type": "insert", "position": 0, "text": "ok", "baseVersion": 1 }
        }))
        .await;
    let ack = socket.recv().await?;
    assert_eq!(ack["event"], "operation_ack");
    assert_eq!(ack["version"], 2);

    server.expect_text("notes", "ok").await;
    Ok(())
}

#[tokio::test]
async fn test_operation_without_join_is_rejected() -> Result<()> {
    logging();
    let server = TestServer::start().await?;
    let token = server.seed_user("alice").await;
    server.seed_document("notes", "alice", "").await;

    let mut socket = server.connect(&token).await?;
    socket
        .send(&json!({
            "event": "operation",
            "operation": { "type": "insert", "position": 0, "text": "x", "baseVersion": 1 }
        }))
        .await;
    let err = socket.recv().await?;
    assert_eq!(err["event"], "error_message");
    Ok(())
}

#[tokio::test]
async fn test_join_missing_document() -> Result<()> {
    logging();
    let server = TestServer::start().await?;
    let token = server.seed_user("alice").await;

    let mut socket = server.connect(&token).await?;
    socket
        .send(&json!({ "event": "join_document", "documentId": "ghost" }))
        .await;
    let err = socket.recv().await?;
    assert_eq!(err["event"], "error_message");
    Ok(())
}
