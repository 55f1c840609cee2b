//! Integration tests that run script bundles inside a real engine

mod host_integration;

use std::{
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, Sender},
    },
    time::Duration,
};

use camino::Utf8PathBuf;
use serial_test::serial;
use tempfile::TempDir;

use crate::{CapturedCallback, HostOptions, HostScheduler, ScriptRuntimeHost};

pub(crate) const WAIT: Duration = Duration::from_secs(10);

/// Minimal stand-in for the filter engine bundle
pub(crate) const MOCK_API: &str = r###"
const filters = new Set();
const subscriptions = [];
let aaEnabled = false;

globalThis.API = {
  addFilter(text) {
    if (text.includes("INVALID")) {
      throw new Error(`Invalid filter: ${text}`);
    }
    filters.add(text);
  },
  removeFilter(text) {
    filters.delete(text);
  },
  clearFilters() {
    filters.clear();
  },
  checkFilterMatch(url, contentTypeMask, documentUrl, siteKey, specificOnly) {
    for (const filter of filters) {
      if (filter.startsWith("@@") && url.includes(filter.slice(2))) {
        return "allowing";
      }
    }
    for (const filter of filters) {
      if (!filter.startsWith("@@") && !filter.includes("#") && url.includes(filter)) {
        return "blocking";
      }
    }
    return null;
  },
  getElementHidingStyleSheet(domain, specificOnly) {
    const selectors = [...filters]
      .filter((f) => f.startsWith("##"))
      .map((f) => f.slice(2));
    return selectors.length ? `${selectors.join(", ")} {display: none !important;}` : null;
  },
  getElementHidingEmulationSelectors(domain) {
    return [...filters]
      .filter((f) => f.startsWith("#?#"))
      .map((f) => ({ selector: f.slice(3), text: `${domain}#?#${f.slice(3)}` }));
  },
  isListedSubscription(url) {
    return subscriptions.includes(url);
  },
  addSubscriptionToList(url) {
    if (!subscriptions.includes(url)) subscriptions.push(url);
  },
  removeSubscriptionFromList(url) {
    const index = subscriptions.indexOf(url);
    if (index >= 0) subscriptions.splice(index, 1);
  },
  getListedSubscriptions() {
    return [...subscriptions];
  },
  setAASubscriptionEnabled(enabled) {
    aaEnabled = enabled;
  },
};
"###;

/// Forwards every scheduled callback to a channel the test drains
pub(crate) struct ChannelScheduler {
    sender: Mutex<Sender<CapturedCallback>>,
}

impl ChannelScheduler {
    pub(crate) fn new() -> (Arc<Self>, Receiver<CapturedCallback>) {
        let (sender, receiver) = mpsc::channel();
        (
            Arc::new(Self {
                sender: Mutex::new(sender),
            }),
            receiver,
        )
    }
}

impl HostScheduler for ChannelScheduler {
    fn schedule(&self, callback: CapturedCallback) {
        let _ = self.sender.lock().unwrap().send(callback);
    }
}

pub(crate) fn utf8_dir(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

pub(crate) fn write_file(dir: &TempDir, name: &str, contents: &str) -> Utf8PathBuf {
    let path = utf8_dir(dir).join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// A host whose bundle is the mock API followed by `script`, rooted in a temp dir
pub(crate) struct TestHost {
    pub(crate) dir: TempDir,
    pub(crate) host: ScriptRuntimeHost,
    pub(crate) callbacks: Receiver<CapturedCallback>,
}

impl TestHost {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, callbacks) = ChannelScheduler::new();
        let host = ScriptRuntimeHost::new(
            HostOptions::default().with_base_dir(utf8_dir(&dir)),
            scheduler,
        );
        Self {
            dir,
            host,
            callbacks,
        }
    }

    pub(crate) fn started() -> Self {
        Self::started_with("__initDone(true);")
    }

    pub(crate) fn started_with(script: &str) -> Self {
        let test_host = Self::new();
        let bundle = write_file(&test_host.dir, "abp.js", &format!("{MOCK_API}\n{script}"));
        test_host.host.initialize(&bundle, &[]).unwrap();
        test_host
    }

    pub(crate) fn eval(&self, source: &str) -> String {
        self.host.evaluate(source).unwrap()
    }

    pub(crate) fn eval_json(&self, source: &str) -> serde_json::Value {
        serde_json::from_str(&self.eval(source)).unwrap()
    }

    pub(crate) fn next_callback(&self) -> CapturedCallback {
        self.callbacks.recv_timeout(WAIT).unwrap()
    }
}
