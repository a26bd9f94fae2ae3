//! Runner tests: real bundles executed in-process through `run_job`.

use deno_core::{v8, JsRuntime, RuntimeOptions};
use serde_json::json;
use ssr_relay::diagnostic::decode_line;
use ssr_relay::relay::{render_invocation, RELAY_HELPER};
use ssr_relay::{run_job, DiagnosticRecord, FatalKind, HtmlTemplate, Kind, RunOutcome, RunnerJob};
use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use tempfile::TempDir;

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Run {
    outcome: RunOutcome,
    markup: String,
    records: Vec<DiagnosticRecord>,
}

fn bundle(entry_src: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("entry.js"), entry_src).unwrap();
    dir
}

fn job(dir: &Path, location: &str, timeout_ms: u64) -> RunnerJob {
    RunnerJob {
        entry: dir.join("entry.js"),
        bundle_root: dir.to_path_buf(),
        location: location.to_string(),
        template: None,
        timeout_ms,
        allowed_origins: vec![],
        max_heap_size: Some(64 * 1024 * 1024),
    }
}

fn with_template(mut job: RunnerJob) -> RunnerJob {
    job.template = Some(HtmlTemplate {
        head: "<main>".into(),
        tail: "</main>".into(),
        script_src: None,
    });
    job
}

async fn run(job: &RunnerJob) -> Run {
    let markup = SharedBuf::default();
    let diagnostics = SharedBuf::default();
    let outcome = run_job(job, Box::new(markup.clone()), Box::new(diagnostics.clone()))
        .await
        .unwrap();
    let records = diagnostics
        .0
        .borrow()
        .split(|b| *b == b'\n')
        .filter_map(decode_line)
        .collect();
    let markup = String::from_utf8(markup.0.borrow().clone()).unwrap();
    Run {
        outcome,
        markup,
        records,
    }
}

#[tokio::test]
async fn streams_async_iterable_inside_template() {
    let dir = bundle(
        r#"
        export default function ({ location, renderToStream }) {
          console.log("rendering", location.pathname, { page: Number(location.search.slice(6)) });
          renderToStream((async function* () {
            yield "<h1>";
            yield location.pathname;
            yield "</h1>";
          })());
        }
        "#,
    );
    let mut job = job(dir.path(), "http://localhost/about?page=2", 5_000);
    job.template = Some(HtmlTemplate {
        head: "<body><div id=\"root\">".into(),
        tail: "</div></body>".into(),
        script_src: None,
    });

    let run = run(&job).await;
    assert_eq!(run.outcome, RunOutcome::Rendered);
    assert_eq!(run.markup, "<body><div id=\"root\"><h1>/about</h1></div></body>");
    assert_eq!(run.records.len(), 1);
    assert_eq!(run.records[0].kind, Kind::Log);
    assert_eq!(
        run.records[0].args,
        vec![
            json!("rendering"),
            json!("/about"),
            json!({ "page": 2 })
        ]
    );
}

#[tokio::test]
async fn write_callback_and_bytes() {
    let dir = bundle(
        r#"
        export async function render({ renderToStream }) {
          await renderToStream(async (write) => {
            write("<p>");
            write(new Uint8Array([104, 105]));
            await Promise.resolve();
            write("</p>");
          });
        }
        "#,
    );
    let run = run(&job(dir.path(), "http://localhost/", 5_000)).await;
    assert_eq!(run.outcome, RunOutcome::Rendered);
    assert_eq!(run.markup, "<p>hi</p>");
}

#[tokio::test]
async fn missing_render_call_is_fatal() {
    let dir = bundle("export default function () { console.info('forgot to render'); }");
    let run = run(&job(dir.path(), "http://localhost/", 5_000)).await;

    assert_eq!(run.outcome, RunOutcome::Failed(FatalKind::NoRenderInvocation));
    assert!(run.markup.is_empty());
    assert_eq!(run.records.len(), 2);
    assert_eq!(run.records[1].fatal_kind(), Some(FatalKind::NoRenderInvocation));
}

#[tokio::test]
async fn module_without_entry_is_fatal() {
    let dir = bundle("export const answer = 42;");
    let run = run(&job(dir.path(), "http://localhost/", 5_000)).await;
    assert_eq!(run.outcome, RunOutcome::Failed(FatalKind::NoRenderInvocation));
}

#[tokio::test]
async fn throw_before_render_reports_error() {
    let dir = bundle(
        r#"
        function load(id) { throw new RangeError(`no page ${id}`); }
        export default function ({ renderToStream }) {
          load(7);
          renderToStream("<p>unreachable</p>");
        }
        "#,
    );
    let run = run(&job(dir.path(), "http://localhost/", 5_000)).await;

    assert_eq!(run.outcome, RunOutcome::Failed(FatalKind::RuntimeThrow));
    assert!(run.markup.is_empty());
    let error = run.records.last().unwrap().error.as_ref().unwrap();
    assert_eq!(error.name, "RangeError");
    assert_eq!(error.message, "no page 7");
    assert!(error.stack.iter().any(|frame| frame.contains("load")));
}

#[tokio::test]
async fn producer_failure_after_markup_still_closes_template() {
    let dir = bundle(
        r#"
        export default function ({ renderToStream }) {
          renderToStream((function* () {
            yield "<section>";
            throw new Error("lost connection");
          })());
        }
        "#,
    );
    let run = run(&with_template(job(dir.path(), "http://localhost/", 5_000))).await;

    assert_eq!(run.outcome, RunOutcome::Failed(FatalKind::RuntimeThrow));
    assert_eq!(run.markup, "<main><section></main>");
    assert_eq!(run.records.last().unwrap().message(), "lost connection");
}

#[tokio::test]
async fn producer_throwing_before_first_chunk_writes_nothing() {
    let dir = bundle(
        r#"
        export default function ({ renderToStream }) {
          renderToStream(() => { throw new Error("no data"); });
        }
        "#,
    );
    let run = run(&with_template(job(dir.path(), "http://localhost/", 5_000))).await;

    assert_eq!(run.outcome, RunOutcome::Failed(FatalKind::RuntimeThrow));
    assert!(run.markup.is_empty());
    assert_eq!(run.records.last().unwrap().message(), "no data");
}

#[tokio::test]
async fn iterator_rejecting_on_first_step_writes_nothing() {
    let dir = bundle(
        r#"
        export default function ({ renderToStream }) {
          renderToStream({
            [Symbol.asyncIterator]() {
              return { next: () => Promise.reject(new Error("stream broke")) };
            },
          });
        }
        "#,
    );
    let run = run(&with_template(job(dir.path(), "http://localhost/", 5_000))).await;

    assert_eq!(run.outcome, RunOutcome::Failed(FatalKind::RuntimeThrow));
    assert!(run.markup.is_empty());
}

#[tokio::test]
async fn empty_render_still_emits_template() {
    let dir = bundle(
        r#"
        export default function ({ renderToStream }) {
          renderToStream("");
        }
        "#,
    );
    let run = run(&with_template(job(dir.path(), "http://localhost/", 5_000))).await;

    assert_eq!(run.outcome, RunOutcome::Rendered);
    assert_eq!(run.markup, "<main></main>");
}

#[tokio::test]
async fn second_render_call_is_ignored() {
    let dir = bundle(
        r#"
        export default function ({ renderToStream }) {
          renderToStream("<p>first</p>");
          renderToStream("<p>second</p>");
        }
        "#,
    );
    let run = run(&job(dir.path(), "http://localhost/", 5_000)).await;

    assert_eq!(run.outcome, RunOutcome::Rendered);
    assert_eq!(run.markup, "<p>first</p>");
    assert_eq!(run.records.len(), 1);
    assert_eq!(run.records[0].kind, Kind::Warn);
}

#[tokio::test]
async fn console_error_keeps_error_detail() {
    let dir = bundle(
        r#"
        export default function ({ renderToStream }) {
          console.error("fetch failed:", new TypeError("bad json"));
          renderToStream("<p>ok</p>");
        }
        "#,
    );
    let run = run(&job(dir.path(), "http://localhost/", 5_000)).await;

    assert_eq!(run.outcome, RunOutcome::Rendered);
    let record = &run.records[0];
    assert_eq!(record.kind, Kind::Error);
    assert_eq!(record.args, vec![json!("fetch failed:")]);
    let error = record.error.as_ref().unwrap();
    assert_eq!(error.name, "TypeError");
    assert_eq!(error.message, "bad json");
    assert_eq!(error.fatal, None);
}

#[tokio::test]
async fn fetch_denied_without_allowlist() {
    let dir = bundle(
        r#"
        export default async function ({ fetch, renderToStream }) {
          try {
            await fetch("https://api.example.com/items");
          } catch (err) {
            console.warn(err.message);
          }
          renderToStream("<p>offline</p>");
        }
        "#,
    );
    let run = run(&job(dir.path(), "http://localhost/", 5_000)).await;

    assert_eq!(run.outcome, RunOutcome::Rendered);
    assert_eq!(run.records.len(), 1);
    assert!(run.records[0].message().contains("disabled"));
}

#[tokio::test]
async fn no_ambient_capabilities() {
    let dir = bundle(
        r#"
        export default function ({ renderToStream, AbortController }) {
          const controller = new AbortController();
          controller.abort();
          renderToStream([
            typeof globalThis.fetch,
            typeof globalThis.renderToStream,
            typeof globalThis.location,
            typeof globalThis.process,
            typeof globalThis.Deno,
            typeof globalThis.__bootstrap,
            String(controller.signal.aborted),
          ].join(","));
        }
        "#,
    );
    let run = run(&job(dir.path(), "http://localhost/", 5_000)).await;
    assert_eq!(
        run.markup,
        "undefined,undefined,undefined,undefined,undefined,undefined,true"
    );
}

#[tokio::test]
async fn imports_outside_root_fail() {
    let outer = tempfile::tempdir().unwrap();
    let root = outer.path().join("server");
    fs::create_dir(&root).unwrap();
    fs::write(outer.path().join("secret.js"), "export const key = 'x';").unwrap();
    fs::write(
        root.join("entry.js"),
        r#"
        import { key } from "../secret.js";
        export default ({ renderToStream }) => renderToStream(key);
        "#,
    )
    .unwrap();

    let run = run(&job(&root, "http://localhost/", 5_000)).await;
    assert_eq!(run.outcome, RunOutcome::Failed(FatalKind::RuntimeThrow));
    assert!(run.markup.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runaway_bundle_is_terminated() {
    let dir = bundle(
        r#"
        export default function ({ renderToStream }) {
          renderToStream("<p>");
          while (true) {}
        }
        "#,
    );
    let run = run(&job(dir.path(), "http://localhost/", 200)).await;

    assert_eq!(run.outcome, RunOutcome::Failed(FatalKind::TimedOut));
    assert_eq!(run.markup, "<p>");
    assert_eq!(run.records.last().unwrap().fatal_kind(), Some(FatalKind::TimedOut));
}

/// Evaluate the relay helper plus invocations for `records` against a
/// console that records its calls, returning the calls as JSON.
fn replay_on_console(records: &[DiagnosticRecord]) -> serde_json::Value {
    fn script_body(snippet: &str) -> &str {
        snippet
            .strip_prefix("<script>")
            .and_then(|s| s.strip_suffix("</script>"))
            .unwrap()
    }

    let mut source = String::from(
        r#"
        globalThis.calls = [];
        const show = (v) => v instanceof Error ? { name: v.name, message: v.message, stack: v.stack } : v;
        globalThis.console = Object.fromEntries(
          ["log", "info", "warn", "error"].map((k) => [k, (...a) => calls.push([k, ...a.map(show)])]),
        );
        "#,
    );
    source.push_str(script_body(RELAY_HELPER));
    source.push('\n');
    for record in records {
        let snippet = render_invocation(record, 64 * 1024).unwrap();
        source.push_str(script_body(&snippet));
        source.push_str(";\n");
    }
    source.push_str("JSON.stringify(calls)");

    let mut runtime = JsRuntime::new(RuntimeOptions::default());
    let value = runtime.execute_script("<relay>", source).unwrap();
    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, &value);
    serde_json::from_str(&local.to_rust_string_lossy(scope)).unwrap()
}

#[tokio::test]
async fn relay_helper_replays_on_console() {
    let records = vec![
        DiagnosticRecord::new(Kind::Warn, vec![json!("slow query"), json!({ "ms": 120 })]),
        DiagnosticRecord::fatal(FatalKind::RuntimeThrow, "TypeError", "x is undefined").with_stack(vec![
            "at App (file:///bundle/app.js:10:3)".into(),
            "at render (file:///bundle/entry.js:2:1)".into(),
        ]),
    ];
    let calls = replay_on_console(&records);

    assert_eq!(
        calls,
        json!([
            ["warn", "[SSR]", "slow query", { "ms": 120 }],
            [
                "error",
                {
                    "name": "TypeError",
                    "message": "[SSR] x is undefined",
                    "stack": "TypeError: [SSR] x is undefined\n    at App (file:///bundle/app.js:10:3)\n    at render (file:///bundle/entry.js:2:1)"
                }
            ]
        ])
    );
}

#[tokio::test]
async fn relay_helper_keeps_console_error_args() {
    let record = DiagnosticRecord::fatal(FatalKind::RuntimeThrow, "Error", "bad json")
        .with_args(vec![json!("fetch failed:")]);
    let calls = replay_on_console(&[record]);

    assert_eq!(calls[0][0], json!("error"));
    assert_eq!(calls[0][1], json!("[SSR]"));
    assert_eq!(calls[0][2], json!("fetch failed:"));
    assert_eq!(calls[0][3]["message"], json!("[SSR] bad json"));
    assert_eq!(calls[0][3]["stack"], json!("Error: [SSR] bad json"));
}
