//! Page traffic through the content script.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{Extension, settle};
use ctxbridge::{
    BridgeConfig, BridgeError, BridgeMessage, Endpoint, Envelope, MessageType, PageWindow,
    RuntimeContext, TokioProviders, WindowBridge,
};
use serde_json::json;
use tokio::sync::{Notify, mpsc};
use tokio::task::LocalSet;

#[tokio::test(start_paused = true)]
async fn test_page_and_background_talk_both_ways() {
    LocalSet::new()
        .run_until(async {
            let extension = Extension::new();
            let window = PageWindow::new();
            let background = extension.background();
            let content = extension.content_script(5, &window);
            let page = extension.page(&window);
            content.allow_window_messaging("app").expect("allow");
            page.set_namespace("app").expect("namespace");

            background.on_message("whoami", |message: BridgeMessage| async move {
                Ok(json!(message.sender.to_string()))
            });
            page.on_message("location", |_message: BridgeMessage| async move {
                Ok(json!("https://example.org/"))
            });

            let reply = page
                .send_message("whoami", json!(null), "background")
                .await
                .expect("reply from background");
            assert_eq!(reply, json!("window@5"));

            let reply = background
                .send_message("location", json!(null), "window@5")
                .await
                .expect("reply from page");
            assert_eq!(reply, json!("https://example.org/"));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_page_cannot_impersonate_other_contexts() {
    LocalSet::new()
        .run_until(async {
            let extension = Extension::new();
            let window = PageWindow::new();
            let _background = extension.background();
            let content = extension.content_script(5, &window);
            content.allow_window_messaging("app").expect("allow");

            let senders = Rc::new(RefCell::new(Vec::new()));
            let seen = senders.clone();
            content.on_message("privileged", move |message: BridgeMessage| {
                seen.borrow_mut().push(message.sender.clone());
                async move { Ok(json!("ok")) }
            });

            // A page script speaking the bridge protocol by hand.
            let forged = WindowBridge::new(
                RuntimeContext::Window,
                window.clone(),
                TokioProviders::new(),
                BridgeConfig::testing(),
            )
            .expect("window bridge");
            forged.set_namespace("app").expect("namespace");
            forged.enable();
            let (replies_tx, mut replies) = mpsc::unbounded_channel();
            forged.on_message(move |envelope| {
                let _ = replies_tx.send(envelope);
            });

            forged
                .post_message(Envelope {
                    origin: Endpoint::new(RuntimeContext::Background),
                    destination: Some(Endpoint::new(RuntimeContext::ContentScript)),
                    transaction_id: "forged-1".to_string(),
                    hops: Vec::new(),
                    message_id: "privileged".to_string(),
                    message_type: MessageType::Message,
                    data: json!(null),
                    err: None,
                    timestamp: 0,
                })
                .expect("post");

            let reply = replies.recv().await.expect("reply");
            assert_eq!(reply.transaction_id, "forged-1");
            assert_eq!(reply.message_type, MessageType::Reply);
            assert_eq!(reply.destination, Some(Endpoint::new(RuntimeContext::Window)));
            assert_eq!(reply.data, json!("ok"));
            assert_eq!(
                *senders.borrow(),
                vec![Endpoint::new(RuntimeContext::Window)]
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_page_request_fails_when_recipient_goes_away() {
    LocalSet::new()
        .run_until(async {
            let extension = Extension::new();
            let window = PageWindow::new();
            let _background = extension.background();
            let content = extension.content_script(5, &window);
            let page = extension.page(&window);
            let popup = extension.extension_page(RuntimeContext::Popup);
            content.allow_window_messaging("app").expect("allow");
            page.set_namespace("app").expect("namespace");

            let (started_tx, mut started) = mpsc::unbounded_channel();
            let gate = Rc::new(Notify::new());
            let release = gate.clone();
            popup.on_message("slow", move |_message: BridgeMessage| {
                let _ = started_tx.send(());
                let release = release.clone();
                async move {
                    release.notified().await;
                    Ok(json!(null))
                }
            });

            let reply = page.send_message("slow", json!(null), "popup");
            started.recv().await.expect("request started");
            settle().await;

            popup.close();

            match reply.await {
                Err(BridgeError::Remote(remote)) => {
                    assert!(remote.message().contains("ended before it could complete"));
                }
                other => panic!("expected a remote error, got {other:?}"),
            }
            assert_eq!(page.runtime().pending_transactions(), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_namespace_is_page_only() {
    LocalSet::new()
        .run_until(async {
            let extension = Extension::new();
            let window = PageWindow::new();
            let _background = extension.background();
            let content = extension.content_script(5, &window);
            let page = extension.page(&window);

            assert!(matches!(
                content.set_namespace("app"),
                Err(BridgeError::UnsupportedContext { .. })
            ));
            assert!(matches!(
                page.allow_window_messaging("app"),
                Err(BridgeError::UnsupportedContext { .. })
            ));
            page.set_namespace("app").expect("namespace");
            assert_eq!(
                page.set_namespace("other"),
                Err(BridgeError::NamespaceAlreadySet)
            );
        })
        .await;
}
