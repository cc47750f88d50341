// Extension Runtime - QuickJS execution
//
// Provides the execution environment for one loaded artifact:
// - One interpreter context per artifact
// - ES module artifacts evaluated natively, CommonJS artifacts in the sandbox
// - Calls into the exported functions, driving async results to completion
// - Stream sink and state service bridged back into Rust

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use regex::Regex;
use rquickjs::context::EvalOptions;
use rquickjs::{Context, Ctx, Exception, Function, Module, Object, Runtime, Value};

use super::extension::{check_exports, Extension, Isolation};
use super::sandbox::{self, CapabilityLoader, CapabilityResolver, ImportLog, SandboxPolicy};
use super::types::{DestinationContext, ExtensionDescriptor, ExtensionKind, StreamOptions};
use crate::destination::DestinationExtension;
use crate::error::{Error, ExtensionRuntimeError, Result, SourceLocation};
use crate::sync::{CheckpointState, DataRecord, Granularity, Message, MessageSink, PartitionedSink, SourceExtension};
use crate::validation::ValidatorExport;

/// Global the evaluated exports object is parked under
const EXPORTS_GLOBAL: &str = "__extension_exports";

lazy_static::lazy_static! {
    static ref STACK_LOCATION: Regex =
        Regex::new(r"(?m)^\s*at (?:[^\n]*? \()?([^()\n]+?):(\d+)(?::(\d+))?\)?\s*$")
            .expect("valid stack location regex");
}

/// Builds the `{ sink, state }` pair handed to `streamReader`
const STREAM_BRIDGE_JS: &str = r#"
(function (initialState) {
    const emit = globalThis.__sink_emit;
    const openPartition = globalThis.__partition_open;
    const addPartitioned = globalThis.__partition_add;
    delete globalThis.__sink_emit;
    delete globalThis.__partition_open;
    delete globalThis.__partition_add;

    let current = initialState;
    const send = (type, message) => emit(JSON.stringify(message === undefined ? { type } : { type, message }));

    const sink = {
        addRecord: (record) => send("record", record),
        log: (level, message) => send("log", { level: String(level), message: String(message) }),
        changeState: (state) => {
            current = state;
            send("state", state);
        },
        clearStream: () => send("clear_stream"),
        deleteRecords: (timestamp, granularity) => send("delete_records", {
            timestamp: timestamp instanceof Date ? timestamp.toISOString() : timestamp,
            granularity: String(granularity),
        }),
        newTransaction: () => send("new_transaction"),
        partitioned: (granularity) => {
            const handle = openPartition(String(granularity));
            return { addRecord: (record) => addPartitioned(handle, JSON.stringify(record)) };
        },
    };

    const state = {
        get: (key) => current[key],
        set: (key, value) => sink.changeState(Object.assign({}, current, { [key]: value })),
    };

    return { sink, state };
})
"#;

/// Messages emitted during one `streamReader` call
#[derive(Default)]
struct Collector {
    messages: Vec<Message>,
    partitions: Vec<PartitionedSink>,
}

/// Extension runtime for executing artifact code
pub struct ExtensionRuntime {
    extension: Arc<Extension>,
    context: Context,
    denied: ImportLog,
    exports: Vec<String>,
    kind: ExtensionKind,
}

impl ExtensionRuntime {
    /// Evaluate an artifact and check its exported symbols
    pub fn new(extension: Extension, policy: &SandboxPolicy) -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| Error::Sandbox(e.to_string()))?;
        let context = Context::full(&runtime).map_err(|e| Error::Sandbox(e.to_string()))?;
        let denied = ImportLog::default();
        let isolation = extension.isolation();

        // Static imports in ES modules and `import()` in CommonJS share one resolver
        runtime.set_loader(
            CapabilityResolver::new(policy.capabilities.clone(), denied.clone()),
            CapabilityLoader::new(policy.capabilities.clone()),
        );

        log::info!("Loading {} ({:?})", extension.name, isolation);

        let exports = context.with(|ctx| {
            let loaded = (|| {
                sandbox::install(&ctx, &extension.name, policy, &denied, isolation == Isolation::Sandboxed)?;
                let exports = match isolation {
                    Isolation::Native => load_es_module(&ctx, &extension)?,
                    Isolation::Sandboxed => load_commonjs(&ctx, &extension)?,
                };
                ctx.globals().set(EXPORTS_GLOBAL, exports.clone())?;
                exports.keys::<String>().collect::<rquickjs::Result<Vec<_>>>()
            })();
            loaded.map_err(|err| convert_error(&ctx, err, &extension.name, &denied))
        })?;

        if let Some(module) = denied.first() {
            return Err(Error::ForbiddenImport {
                artifact: extension.name.clone(),
                module,
            });
        }

        let kind = check_exports(&exports)?;
        log::info!("Loaded {} as a {:?} extension, exports: {:?}", extension.name, kind, exports);

        Ok(Self {
            extension: Arc::new(extension),
            context,
            denied,
            exports,
            kind,
        })
    }

    pub fn extension(&self) -> &Extension {
        &self.extension
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn kind(&self) -> ExtensionKind {
        self.kind
    }

    fn has_export(&self, name: &str) -> bool {
        self.exports.iter().any(|e| e == name)
    }

    /// Read the exported descriptor (an object, or a function returning one)
    pub fn descriptor(&self) -> Result<ExtensionDescriptor> {
        let json = self.run_js(|ctx| {
            let exports: Object = ctx.globals().get(EXPORTS_GLOBAL)?;
            let value: Value = exports.get("descriptor")?;
            let value = match value.as_function() {
                Some(func) => settle(func.call::<_, Value>(())?)?,
                None => value,
            };
            stringify(ctx, value)
        })?;

        let raw = parse_json(json)?;
        serde_json::from_value(raw).map_err(|e| Error::InvalidExports {
            reason: format!("`descriptor` is malformed: {}", e),
            exports: self.exports.clone(),
        })
    }

    /// Call an exported function with JSON arguments
    fn call_export(&self, name: &str, args: &[&serde_json::Value]) -> Result<serde_json::Value> {
        let encoded: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let json = self.run_js(|ctx| {
            let func = export_function(ctx, name)?;
            let mut values = Vec::with_capacity(encoded.len());
            for arg in &encoded {
                values.push(ctx.json_parse(arg.as_str())?);
            }
            let result = match values.len() {
                0 => func.call::<_, Value>(())?,
                1 => func.call::<_, Value>((values[0].clone(),))?,
                _ => func.call::<_, Value>((values[0].clone(), values[1].clone()))?,
            };
            stringify(ctx, settle(result)?)
        })?;
        parse_json(json)
    }

    /// Run JS against this context, mapping exceptions and sandbox denials
    fn run_js<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(&Ctx<'js>) -> rquickjs::Result<T>,
    {
        let result = self.context.with(|ctx| {
            f(&ctx).map_err(|err| convert_error(&ctx, err, &self.extension.name, &self.denied))
        });

        // A denied import fails the call even if the extension swallowed the error
        if let Some(module) = self.denied.first() {
            return Err(Error::ForbiddenImport {
                artifact: self.extension.name.clone(),
                module,
            });
        }
        result
    }
}

impl ValidatorExport for ExtensionRuntime {
    fn has_validator(&self) -> bool {
        self.has_export("validator")
    }

    fn run_validator(&self, config: &serde_json::Value) -> Result<serde_json::Value> {
        self.call_export("validator", &[config])
    }
}

impl DestinationExtension for ExtensionRuntime {
    fn transform(&self, event: &serde_json::Value, context: &DestinationContext) -> Result<serde_json::Value> {
        let context = serde_json::to_value(context)?;
        self.call_export("destination", &[event, &context])
    }
}

impl SourceExtension for ExtensionRuntime {
    fn source_catalog(&self, config: &serde_json::Value) -> Result<serde_json::Value> {
        self.call_export("sourceCatalog", &[config])
    }

    fn read_stream(
        &self,
        config: &serde_json::Value,
        stream_type: &str,
        options: &StreamOptions,
        state: &CheckpointState,
        sink: &mut dyn MessageSink,
    ) -> Result<()> {
        let config = config.to_string();
        let options = serde_json::to_string(options)?;
        let state = serde_json::Value::Object(state.clone()).to_string();
        let collector = Rc::new(RefCell::new(Collector::default()));

        let outcome = self.run_js(|ctx| {
            install_stream_bridge(ctx, &collector)?;
            let make_io: Function = sandbox::eval_host(ctx, STREAM_BRIDGE_JS)?;
            let io: Object = make_io.call((ctx.json_parse(state.as_str())?,))?;

            let services = Object::new(ctx.clone())?;
            services.set("state", io.get::<_, Object>("state")?)?;

            let reader = export_function(ctx, "streamReader")?;
            let result: Value = reader.call((
                ctx.json_parse(config.as_str())?,
                stream_type,
                ctx.json_parse(options.as_str())?,
                io.get::<_, Object>("sink")?,
                services,
            ))?;
            settle(result).map(|_| ())
        });

        // Everything emitted before a failure still reaches the sink, in order
        let messages = std::mem::take(&mut collector.borrow_mut().messages);
        for message in messages {
            sink.emit(message);
        }

        outcome
    }
}

fn install_stream_bridge<'js>(ctx: &Ctx<'js>, collector: &Rc<RefCell<Collector>>) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let target = collector.clone();
    globals.set(
        "__sink_emit",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, json: String| -> rquickjs::Result<()> {
                let message: Message = serde_json::from_str(&json)
                    .map_err(|e| Exception::throw_message(&ctx, &format!("invalid stream message: {}", e)))?;
                target.borrow_mut().messages.push(message);
                Ok(())
            },
        )?,
    )?;

    let target = collector.clone();
    globals.set(
        "__partition_open",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, granularity: String| -> rquickjs::Result<u32> {
                let granularity: Granularity = serde_json::from_value(serde_json::Value::String(granularity))
                    .map_err(|e| Exception::throw_message(&ctx, &format!("invalid partition granularity: {}", e)))?;
                let mut collector = target.borrow_mut();
                collector.partitions.push(PartitionedSink::new(granularity));
                Ok((collector.partitions.len() - 1) as u32)
            },
        )?,
    )?;

    let target = collector.clone();
    globals.set(
        "__partition_add",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, handle: u32, json: String| -> rquickjs::Result<()> {
                let record: DataRecord = serde_json::from_str(&json)
                    .map_err(|e| Exception::throw_message(&ctx, &format!("invalid record: {}", e)))?;
                let mut collector = target.borrow_mut();
                let Collector { messages, partitions } = &mut *collector;
                let partition = partitions
                    .get_mut(handle as usize)
                    .ok_or_else(|| Exception::throw_message(&ctx, "unknown partition handle"))?;
                partition
                    .add_record(messages, record)
                    .map_err(|message| Exception::throw_message(&ctx, &message))
            },
        )?,
    )?;

    Ok(())
}

fn load_commonjs<'js>(ctx: &Ctx<'js>, extension: &Extension) -> rquickjs::Result<Object<'js>> {
    // The wrapper shares the artifact's first line so line numbers stay intact
    let wrapped = format!(
        "(function () {{ const module = {{ exports: {{}} }}; (function (exports, require, module, __filename, __dirname) {{{}\n}})(module.exports, globalThis.__require, module, {}, \"/\"); return module.exports; }})()",
        extension.code,
        serde_json::Value::from(extension.name.as_str())
    );
    ctx.eval_with_options::<Object, _>(
        wrapped,
        {
            let mut options = EvalOptions::default();
            options.filename = Some(extension.name.clone());
            options
        },
    )
}

fn load_es_module<'js>(ctx: &Ctx<'js>, extension: &Extension) -> rquickjs::Result<Object<'js>> {
    let declared = Module::declare(ctx.clone(), extension.name.as_str(), extension.code.as_str())?;
    let (module, promise) = declared.eval()?;
    promise.finish::<()>()?;
    module.namespace()
}

fn export_function<'js>(ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Function<'js>> {
    let exports: Object = ctx.globals().get(EXPORTS_GLOBAL)?;
    match exports.get::<_, Option<Function>>(name)? {
        Some(func) => Ok(func),
        None => Err(Exception::throw_message(ctx, &format!("export `{}` is not a function", name))),
    }
}

/// Drive a promise to completion; plain values pass through
fn settle<'js>(value: Value<'js>) -> rquickjs::Result<Value<'js>> {
    match value.as_promise() {
        Some(promise) => promise.finish::<Value>(),
        None => Ok(value),
    }
}

/// JSON text of a value, `None` for undefined and functions
fn stringify<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Option<String>> {
    match ctx.json_stringify(value)? {
        Some(json) => Ok(Some(json.to_string()?)),
        None => Ok(None),
    }
}

fn parse_json(json: Option<String>) -> Result<serde_json::Value> {
    match json {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(serde_json::Value::Null),
    }
}

fn convert_error(ctx: &Ctx<'_>, err: rquickjs::Error, artifact: &str, denied: &ImportLog) -> Error {
    if let Some(module) = denied.first() {
        return Error::ForbiddenImport {
            artifact: artifact.to_string(),
            module,
        };
    }

    match err {
        rquickjs::Error::Exception => Error::ExtensionRuntime(exception_details(ctx, ctx.catch(), artifact)),
        other => Error::Sandbox(other.to_string()),
    }
}

fn exception_details<'js>(ctx: &Ctx<'js>, thrown: Value<'js>, artifact: &str) -> ExtensionRuntimeError {
    let (message, stack, file, line, column) = match thrown.as_object() {
        Some(obj) => (
            obj.get::<_, Option<String>>("message").ok().flatten(),
            obj.get::<_, Option<String>>("stack").ok().flatten(),
            obj.get::<_, Option<String>>("fileName").ok().flatten(),
            obj.get::<_, Option<u32>>("lineNumber").ok().flatten(),
            obj.get::<_, Option<u32>>("columnNumber").ok().flatten(),
        ),
        None => (None, None, None, None, None),
    };

    let message = message.unwrap_or_else(|| describe_thrown(ctx, thrown.clone()));

    // Prefer the innermost artifact frame; syntax errors only carry fileName/lineNumber
    let location = stack
        .as_deref()
        .and_then(|stack| location_from_stack(stack, artifact))
        .or_else(|| match (file, line) {
            (Some(file), Some(line)) if file == artifact => Some(SourceLocation {
                file,
                line,
                column,
            }),
            _ => None,
        });

    ExtensionRuntimeError {
        message,
        stack,
        location,
    }
}

fn describe_thrown<'js>(ctx: &Ctx<'js>, thrown: Value<'js>) -> String {
    if let Some(s) = thrown.as_string().and_then(|s| s.to_string().ok()) {
        return s;
    }
    stringify(ctx, thrown)
        .ok()
        .flatten()
        .unwrap_or_else(|| "unknown error".to_string())
}

/// First `at ...:line[:column]` frame of a stack trace that lies in the artifact
///
/// Frames from host glue (evaluated as `HOST_SCRIPT`) and capability shims
/// are skipped.
fn location_from_stack(stack: &str, artifact: &str) -> Option<SourceLocation> {
    STACK_LOCATION
        .captures_iter(stack)
        .filter(|captures| captures.get(1).is_some_and(|file| file.as_str() == artifact))
        .find_map(|captures| {
            Some(SourceLocation {
                file: artifact.to_string(),
                line: captures.get(2)?.as_str().parse().ok()?,
                column: captures.get(3).and_then(|c| c.as_str().parse().ok()),
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{DestinationEngine, DestinationRun, EventOutcome};
    use crate::sync::{JsonFileStateStore, StateStore, StreamSink, SyncEngine, SyncRequest};
    use serde_json::json;

    fn runtime(name: &str, code: &str) -> Result<ExtensionRuntime> {
        let extension = Extension::from_code(name, code)?;
        ExtensionRuntime::new(extension, &SandboxPolicy::default())
    }

    const CJS_DESTINATION: &str = r#"//format=cjs
const crypto = require("crypto");
module.exports = {
    descriptor: { id: "hook", displayName: "Webhook" },
    validator: (config) => config.url ? true : "url is required",
    destination: (event, ctx) => {
        if (event.skip) return undefined;
        if (event.explode) throw new Error("cannot map event " + event.n);
        const msg = {
            method: "POST",
            url: ctx.config.url,
            headers: { "X-Signature": crypto.createHash("sha256").update(JSON.stringify(event)).digest("hex") },
            body: event,
        };
        return event.twice ? [msg, msg] : msg;
    },
};
"#;

    const ESM_SOURCE: &str = r#"//format=esm
import { randomUUID } from "crypto";

export const descriptor = { id: "counter", configurationParameters: [] };

export async function sourceCatalog(config) {
    return [{ type: "numbers", supportedModes: ["incremental"], params: [{ id: "limit", defaultValue: 3 }] }];
}

export async function streamReader(config, streamType, { mode, parameters }, sink, { state }) {
    const start = state.get("cursor") || 0;
    sink.log("info", "starting at " + start + " " + typeof randomUUID());
    for (let i = start; i < start + parameters.limit; i++) {
        await Promise.resolve();
        sink.addRecord({ $id: String(i), value: i * 10, __sql_type_value: "bigint" });
        state.set("cursor", i + 1);
    }
    if (config.failAfterEmit) throw new Error("upstream API returned 500");
}
"#;

    #[test]
    fn test_sandbox_removes_dangerous_globals() {
        let rt = runtime(
            "globals.js",
            r#"//format=cjs
module.exports = {
    descriptor: () => ({
        id: [typeof eval, typeof Buffer, typeof process.env.HOME, typeof console.log].join(","),
    }),
    destination: () => undefined,
};
"#,
        )
        .unwrap();

        assert_eq!(rt.descriptor().unwrap().id, "undefined,undefined,undefined,function");
    }

    #[test]
    fn test_forbidden_require_fails_load() {
        let err = runtime(
            "net.js",
            "//format=cjs\nconst net = require(\"net\");\nmodule.exports = { descriptor: {}, destination: () => {} };\n",
        )
        .err()
        .unwrap();

        match err {
            Error::ForbiddenImport { artifact, module } => {
                assert_eq!(artifact, "net.js");
                assert_eq!(module, "net");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_swallowed_forbidden_require_still_fails() {
        let rt = runtime(
            "sneaky.js",
            r#"//format=cjs
module.exports = {
    descriptor: { id: "sneaky" },
    destination: () => {
        try { require("child_process_real"); } catch (e) {}
        return undefined;
    },
};
"#,
        )
        .unwrap();

        let err = rt
            .transform(
                &json!({}),
                &DestinationContext {
                    destination_id: "d".to_string(),
                    destination_type: "t".to_string(),
                    config: json!({}),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::ForbiddenImport { ref module, .. } if module == "child_process_real"));
    }

    #[test]
    fn test_forbidden_es_import_fails_load() {
        let err = runtime(
            "esm.js",
            "//format=esm\nimport pg from \"pg\";\nexport const descriptor = {};\nexport const destination = () => {};\n",
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::ForbiddenImport { ref module, .. } if module == "pg"));
    }

    #[test]
    fn test_mocked_fs_throws_on_use() {
        let rt = runtime(
            "fs.js",
            r#"//format=cjs
const fs = require("node:fs");
module.exports = {
    descriptor: { id: "fs" },
    validator: () => {
        if (fs.existsSync("/etc/passwd")) return "existsSync should be mocked";
        fs.readFileSync("/etc/passwd");
        return true;
    },
    destination: () => undefined,
};
"#,
        )
        .unwrap();

        let err = rt.run_validator(&json!({})).unwrap_err();
        match err {
            Error::ExtensionRuntime(e) => assert!(e.message.contains("fs.readFileSync is not available")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_both_kinds_exported_is_rejected() {
        let err = runtime(
            "both.js",
            "//format=cjs\nmodule.exports = { descriptor: {}, destination() {}, streamReader() {}, sourceCatalog() {} };\n",
        )
        .err()
        .unwrap();

        let message = err.to_string();
        assert!(message.contains("destination"));
        assert!(message.contains("streamReader"));
    }

    #[test]
    fn test_exception_carries_message_and_line() {
        let rt = runtime(
            "throws.js",
            "//format=cjs\nmodule.exports = {\n  descriptor: { id: \"t\" },\n  validator: () => {\n    throw new Error(\"bad token\");\n  },\n  destination: () => undefined,\n};\n",
        )
        .unwrap();

        match rt.run_validator(&json!({})).unwrap_err() {
            Error::ExtensionRuntime(e) => {
                assert_eq!(e.message, "bad token");
                assert_eq!(e.location.map(|l| l.line), Some(5));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_destination_batch_through_sandbox() {
        let rt = runtime("hook.js", CJS_DESTINATION).unwrap();
        assert_eq!(rt.kind(), ExtensionKind::Destination);

        let events = vec![
            json!({ "n": 1 }),
            json!({ "n": 2, "explode": true }),
            json!({ "n": 3, "skip": true }),
            json!({ "n": 4, "twice": true }),
        ];
        let run = DestinationRun {
            destination_id: "hook".to_string(),
            destination_type: "webhook".to_string(),
            config: json!({ "url": "https://hooks.example.com/in" }),
            skip_validation: false,
        };

        let report = DestinationEngine::new(&rt).execute(&events, &run).unwrap();

        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.emitted(), 3);
        match &report.results[0].outcome {
            EventOutcome::Emitted { messages } => {
                assert_eq!(messages[0].url, "https://hooks.example.com/in");
                assert_eq!(messages[0].headers.as_ref().unwrap()["X-Signature"].len(), 64);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(&report.results[1].outcome, EventOutcome::Failed { error, .. } if error.contains("cannot map event 2")));
    }

    #[test]
    fn test_destination_validator_rejects_config() {
        let rt = runtime("hook.js", CJS_DESTINATION).unwrap();
        let run = DestinationRun {
            destination_id: "hook".to_string(),
            destination_type: "webhook".to_string(),
            config: json!({}),
            skip_validation: false,
        };

        let err = DestinationEngine::new(&rt).execute(&[json!({})], &run).unwrap_err();
        assert_eq!(err.to_string(), "configuration is invalid: url is required");
    }

    #[test]
    fn test_es_module_source_emits_messages() {
        let rt = runtime("counter.js", ESM_SOURCE).unwrap();
        assert_eq!(rt.kind(), ExtensionKind::Source);
        assert_eq!(rt.descriptor().unwrap().id, "counter");

        let options = StreamOptions {
            mode: crate::extensions::SyncMode::Incremental,
            parameters: json!({ "limit": 2 }).as_object().unwrap().clone(),
        };
        let mut sink = StreamSink::new();
        rt.read_stream(&json!({}), "numbers", &options, &CheckpointState::new(), &mut sink)
            .unwrap();

        let kinds: Vec<_> = sink.messages().iter().map(Message::kind).collect();
        assert_eq!(kinds, vec!["log", "record", "state", "record", "state"]);
        match &sink.messages()[1] {
            Message::Record(record) => {
                assert_eq!(record.id, "0");
                assert_eq!(record.sql_types["value"], "bigint");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(sink.latest_state().unwrap()["cursor"], json!(2));
    }

    #[test]
    fn test_sync_engine_commits_only_clean_runs() {
        let rt = runtime("counter.js", ESM_SOURCE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::for_extension(dir.path(), "counter");
        let engine = SyncEngine::new(&rt, &store);

        let report = engine
            .run(&SyncRequest {
                config: json!({}),
                selector: None,
            })
            .unwrap();
        assert_eq!(report.table.len(), 3);
        assert_eq!(store.load().unwrap()["cursor"], json!(3));

        // Second run resumes from the checkpoint, then fails after emitting state
        let err = engine
            .run(&SyncRequest {
                config: json!({ "failAfterEmit": true }),
                selector: None,
            })
            .unwrap_err();
        assert!(err.to_string().contains("upstream API returned 500"));
        assert_eq!(store.load().unwrap()["cursor"], json!(3));
    }

    #[test]
    fn test_partitioned_helper_from_javascript() {
        let rt = runtime(
            "daily.js",
            r#"//format=cjs
module.exports = {
    descriptor: { id: "daily" },
    sourceCatalog: () => [{ type: "events", supportedModes: ["full_sync"] }],
    streamReader: (config, type, opts, sink) => {
        const daily = sink.partitioned("day");
        daily.addRecord({ $id: "a", $recordTimestamp: "2024-02-01T08:00:00Z" });
        daily.addRecord({ $id: "b", $recordTimestamp: "2024-02-01T09:00:00Z" });
        daily.addRecord({ $id: "c", $recordTimestamp: "2024-02-02T09:00:00Z" });
    },
};
"#,
        )
        .unwrap();

        let options = StreamOptions {
            mode: crate::extensions::SyncMode::FullSync,
            parameters: Default::default(),
        };
        let mut sink = StreamSink::new();
        rt.read_stream(&json!({}), "events", &options, &CheckpointState::new(), &mut sink)
            .unwrap();

        let transactions = sink
            .messages()
            .iter()
            .filter(|m| matches!(m, Message::NewTransaction))
            .count();
        assert_eq!(transactions, 2);
    }

    #[test]
    fn test_location_from_stack_skips_host_frames() {
        let stack = "Error: x\n    at digest (native)\n    at digest (<sandbox>:39:81)\n    at validator (a.js:12:7)\n    at <eval> (a.js:20)\n";
        let location = location_from_stack(stack, "a.js").unwrap();
        assert_eq!(location.line, 12);
        assert_eq!(location.column, Some(7));
        assert_eq!(location.file, "a.js");

        assert!(location_from_stack("    at fetch (<sandbox>:39:81)\n", "a.js").is_none());
        assert!(location_from_stack("no frames here", "a.js").is_none());
    }

    #[test]
    fn test_capability_error_points_at_artifact_line() {
        let rt = runtime(
            "digest.js",
            "//format=cjs\nconst crypto = require(\"crypto\");\nmodule.exports = {\n    descriptor: { id: \"digest\" },\n    validator: () => crypto.createHash(\"md5\").update(\"x\").digest(\"hex\"),\n    destination: () => undefined,\n};\n",
        )
        .unwrap();

        match rt.run_validator(&json!({})).unwrap_err() {
            Error::ExtensionRuntime(e) => {
                assert!(e.message.contains("unsupported algorithm `md5`"));
                let location = e.location.unwrap();
                assert_eq!(location.file, "digest.js");
                assert_eq!(location.line, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    const DYNAMIC_IMPORT: &str = r#"//format=cjs
module.exports = {
    descriptor: { id: "dynamic" },
    validator: async (config) => {
        const crypto = await import(config.module);
        return crypto.createHash("sha256").update("abc").digest("hex").length === 64;
    },
    destination: () => undefined,
};
"#;

    #[test]
    fn test_dynamic_import_of_capability_in_commonjs() {
        let rt = runtime("dynamic.js", DYNAMIC_IMPORT).unwrap();
        assert_eq!(rt.run_validator(&json!({ "module": "crypto" })).unwrap(), json!(true));
        assert_eq!(rt.run_validator(&json!({ "module": "node:crypto" })).unwrap(), json!(true));
    }

    #[test]
    fn test_dynamic_import_outside_table_in_commonjs() {
        let rt = runtime("dynamic.js", DYNAMIC_IMPORT).unwrap();
        match rt.run_validator(&json!({ "module": "pg" })).unwrap_err() {
            Error::ForbiddenImport { artifact, module } => {
                assert_eq!(artifact, "dynamic.js");
                assert_eq!(module, "pg");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    const FETCHER: &str = r#"//format=cjs
module.exports = {
    descriptor: { id: "fetcher" },
    validator: async (config) => {
        const res = await fetch(config.url, {
            method: "post",
            headers: { "X-Key": "k1" },
            body: JSON.stringify({ hook: 1 }),
        });
        const payload = await res.json();
        return res.ok && res.status === 200 && payload.accepted === true
            && res.headers.get("Content-Type") === "application/json";
    },
    destination: () => undefined,
};
"#;

    /// Answer one HTTP request with a JSON body; the handle yields the raw request
    fn serve_once(body: &'static str) -> (u16, std::thread::JoinHandle<String>) {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                let complete = text.find("\r\n\r\n").is_some_and(|head_end| {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    received.len() >= head_end + 4 + length
                });
                if n == 0 || complete {
                    break;
                }
            }
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .unwrap();
            String::from_utf8_lossy(&received).to_string()
        });
        (port, handle)
    }

    #[test]
    fn test_fetch_from_extension_code() {
        let (port, server) = serve_once(r#"{"accepted":true}"#);
        let rt = runtime("fetcher.js", FETCHER).unwrap();

        let url = format!("http://127.0.0.1:{}/hooks", port);
        assert_eq!(rt.run_validator(&json!({ "url": url })).unwrap(), json!(true));

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /hooks HTTP/1.1"));
        assert!(request.ends_with(r#"{"hook":1}"#));
    }

    #[test]
    fn test_fetch_blocked_by_network_policy() {
        let extension = Extension::from_code("fetcher.js", FETCHER).unwrap();
        let policy = SandboxPolicy {
            network: sandbox::NetworkPolicy::allow_hosts(["api.example.com"]),
            ..Default::default()
        };
        let rt = ExtensionRuntime::new(extension, &policy).unwrap();

        match rt.run_validator(&json!({ "url": "https://other.example.org/hooks" })).unwrap_err() {
            Error::ExtensionRuntime(e) => {
                assert!(e.message.contains("not allowed by the sandbox network policy"));
                assert_eq!(e.location.map(|l| l.file), Some("fetcher.js".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
