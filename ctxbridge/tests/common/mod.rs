//! Shared harness: one in-process host and helpers to bring up contexts.

#![allow(dead_code)]

use std::rc::Rc;
use std::time::Duration;

use ctxbridge::{
    Bridge, BridgeConfig, MemoryHost, PageWindow, PortSender, RuntimeContext, TokioProviders,
};

pub type TestBridge = Bridge<TokioProviders>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

/// Let every ready task run. Time is paused in these tests, so the sleep
/// only completes once the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// A simulated browser extension sharing one host.
pub struct Extension {
    pub host: MemoryHost,
    pub providers: TokioProviders,
}

impl Extension {
    pub fn new() -> Self {
        init_tracing();
        Self {
            host: MemoryHost::new(),
            providers: TokioProviders::new(),
        }
    }

    pub fn background(&self) -> TestBridge {
        Bridge::background(self.providers.clone(), self.host.listen())
    }

    pub fn extension_page(&self, context: RuntimeContext) -> TestBridge {
        Bridge::extension_page(
            context,
            self.providers.clone(),
            BridgeConfig::testing(),
            Rc::new(self.host.connector(PortSender::extension_page())),
        )
        .expect("extension page bridge")
    }

    pub fn devtools(&self, tab_id: u32) -> TestBridge {
        Bridge::extension_page(
            RuntimeContext::Devtools,
            self.providers.clone(),
            BridgeConfig::testing(),
            Rc::new(self.host.connector(PortSender::tab(tab_id))),
        )
        .expect("devtools bridge")
    }

    pub fn content_script(&self, tab_id: u32, window: &PageWindow) -> TestBridge {
        Bridge::content_script(
            self.providers.clone(),
            BridgeConfig::testing(),
            Rc::new(self.host.connector(PortSender::tab(tab_id))),
            window.clone(),
        )
        .expect("content script bridge")
    }

    pub fn page(&self, window: &PageWindow) -> TestBridge {
        Bridge::page(self.providers.clone(), BridgeConfig::testing(), window.clone())
            .expect("page bridge")
    }
}
