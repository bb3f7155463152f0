//! Development session with hot updates.
//!
//! A [`DevSession`] keeps a tolerant build in memory. File changes rebuild
//! only the affected part of the graph, re-emit, and produce the
//! [`HmrMessage`](sluice_proto::HmrMessage) to push to clients. The HTTP and
//! WebSocket side lives in the CLI.

mod session;

pub use session::{ContextLoader, DevSession};

use crate::builder::mime_for;
use sluice_proto::HMR_ENDPOINT;

/// URL of the client script injected into the HTML document.
pub const CLIENT_PATH: &str = "/__sluice/hmr.js";

/// URL prefix under which chunks are served by name: `/__sluice/chunk/<name>.js`.
pub const CHUNK_PREFIX: &str = "/__sluice/chunk/";

/// The browser side of hot updates.
///
/// On `update` it loads every changed chunk by name, drops the cached
/// exports of the changed modules and re-runs the entries. Stylesheets are
/// swapped in place. `error` shows an overlay until the next good update.
const HMR_CLIENT: &str = r#"(function () {
  var chunkPrefix = "__CHUNK_PREFIX__";
  var overlay = null;

  function showOverlay(message, file) {
    hideOverlay();
    overlay = document.createElement("pre");
    overlay.setAttribute("style",
      "position:fixed;inset:0;z-index:99999;margin:0;padding:24px;overflow:auto;" +
      "background:rgba(20,20,20,.92);color:#ff8080;font:13px/1.5 monospace;white-space:pre-wrap");
    overlay.textContent = (file ? file + "\n\n" : "") + message;
    document.body.appendChild(overlay);
  }

  function hideOverlay() {
    if (overlay) overlay.remove();
    overlay = null;
  }

  function loadScript(name) {
    return new Promise(function (resolve, reject) {
      var script = document.createElement("script");
      script.src = chunkPrefix + encodeURIComponent(name) + ".js?t=" + Date.now();
      script.onload = function () { script.remove(); resolve(); };
      script.onerror = function () { reject(new Error("failed to load chunk " + name)); };
      document.head.appendChild(script);
    });
  }

  function swapStyles(name) {
    var map = self.__sluice_chunks__ || {};
    var current = map[name] && map[name].css;
    var next = chunkPrefix + encodeURIComponent(name) + ".css?t=" + Date.now();
    var links = document.querySelectorAll('link[rel="stylesheet"]');
    for (var i = 0; i < links.length; i++) {
      var href = links[i].getAttribute("href");
      if (href === current || links[i].dataset.sluiceChunk === name) {
        links[i].setAttribute("href", next);
        links[i].dataset.sluiceChunk = name;
        return;
      }
    }
    var link = document.createElement("link");
    link.rel = "stylesheet";
    link.href = next;
    link.dataset.sluiceChunk = name;
    document.head.appendChild(link);
  }

  function applyUpdate(msg) {
    var names = Object.keys(msg.chunkHashes || {});
    var scripts = names.filter(function (n) { return !/\.css$/.test(n); });
    names.filter(function (n) { return /\.css$/.test(n); }).forEach(function (n) {
      swapStyles(n.slice(0, -4));
    });
    Promise.all(scripts.map(loadScript)).then(function () {
      var runtime = self.__sluice__;
      if (!runtime) return location.reload();
      runtime.invalidate(msg.changedModuleIds || []);
      runtime.restart();
      console.log("[sluice] updated " + (msg.changedModuleIds || []).length + " module(s)");
    }).catch(function (err) {
      console.error("[sluice]", err);
      location.reload();
    });
  }

  var ws = new WebSocket((location.protocol === "https:" ? "wss://" : "ws://") + location.host + "__HMR_ENDPOINT__");
  var connected = false;
  ws.onopen = function () { connected = true; };
  ws.onmessage = function (event) {
    var msg = JSON.parse(event.data);
    switch (msg.type) {
      case "connected":
        console.log("[sluice] connected.");
        break;
      case "update":
        hideOverlay();
        applyUpdate(msg);
        break;
      case "reload":
        location.reload();
        break;
      case "error":
        showOverlay(msg.message, msg.file);
        break;
    }
  };
  ws.onclose = function () {
    if (connected) {
      console.log("[sluice] server connection lost, reloading...");
      setTimeout(function () { location.reload(); }, 1000);
    }
  };
})();
"#;

/// The client script served at [`CLIENT_PATH`].
#[must_use]
pub fn client_script() -> String {
    HMR_CLIENT
        .replace("__CHUNK_PREFIX__", CHUNK_PREFIX)
        .replace("__HMR_ENDPOINT__", HMR_ENDPOINT)
}

/// Add the client `<script>` tag before `</body>` (or at the end).
#[must_use]
pub fn inject_client(html: &str) -> String {
    let tag = format!("<script src=\"{CLIENT_PATH}\"></script>\n");
    match html.rfind("</body>") {
        Some(pos) => format!("{}{tag}{}", &html[..pos], &html[pos..]),
        None => format!("{html}{tag}"),
    }
}

/// `Content-Type` for a served path.
#[must_use]
pub fn content_type(path: &str) -> &'static str {
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map_or("", |(_, ext)| ext);
    match ext {
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "json" | "map" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        _ => mime_for(ext),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_script_placeholders() {
        let script = client_script();
        assert!(script.contains("\"/__sluice/chunk/\""));
        assert!(script.contains("location.host + \"/__hmr\""));
        assert!(!script.contains("__HMR_ENDPOINT__"));
    }

    #[test]
    fn test_inject_client() {
        assert_eq!(
            inject_client("<body><p></p></body>"),
            "<body><p></p><script src=\"/__sluice/hmr.js\"></script>\n</body>"
        );
        assert!(inject_client("<p>").ends_with("</script>\n"));
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("js/main.1234.js"), "application/javascript; charset=utf-8");
        assert_eq!(content_type("index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type("img/logo.png"), "image/png");
        assert_eq!(content_type("v1.2/LICENSE"), "application/octet-stream");
    }
}
