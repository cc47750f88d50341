// Extension Sandbox - capability table and host bindings
//
// Extension code can only reach the host through the entries of a
// CapabilityTable. Anything else it tries to `require` or `import` is denied
// and recorded, so the runtime can report which module escaped the artifact.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use base64::prelude::{Engine as _, BASE64_STANDARD};
use rquickjs::loader::{Loader, Resolver};
use rquickjs::context::EvalOptions;
use rquickjs::module::Declared;
use rquickjs::{Ctx, Exception, FromJs, Function, Module, Object};
use serde::Deserialize;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

/// Upper bound for a response body handed to extension code
const MAX_RESPONSE_BYTES: u64 = 10_000_000;

/// Script name host-side JS is evaluated under, never an artifact name
pub const HOST_SCRIPT: &str = "<sandbox>";

/// Characters of an extension-supplied URL kept in log lines
const MAX_LOGGED_URL_CHARS: usize = 100;

/// A named module extension code may import
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub name: &'static str,
    /// Named exports offered to ES module imports
    pub exports: &'static [&'static str],
    /// Mocked capabilities exist only so imports succeed; their members throw
    pub mocked: bool,
    source: &'static str,
}

impl Capability {
    /// ES module shim re-exporting the capability object
    fn module_shim(&self) -> String {
        let mut shim = format!(
            "const capability = globalThis.__require({});\nexport default capability;\n",
            quote(self.name)
        );
        for export in self.exports {
            shim.push_str(&format!("export const {0} = capability.{0};\n", export));
        }
        shim
    }
}

/// Allow-list of modules available inside the sandbox
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    entries: BTreeMap<&'static str, Capability>,
}

impl CapabilityTable {
    pub fn standard() -> Self {
        let capabilities = [
            Capability {
                name: "crypto",
                exports: &["randomUUID", "createHash"],
                mocked: false,
                source: CRYPTO_JS,
            },
            Capability {
                name: "util",
                exports: &["format", "inspect"],
                mocked: false,
                source: "({ format: (...args) => formatArgs(args), inspect: (value) => describe(value) })",
            },
            Capability {
                name: "url",
                exports: &["parse"],
                mocked: false,
                source: "({ parse: (href) => JSON.parse(host.parseUrl(String(href))) })",
            },
            Capability {
                name: "node-fetch",
                exports: &[],
                mocked: false,
                source: "(() => { const f = (...args) => globalThis.fetch(...args); f.default = f; return f; })()",
            },
            Capability {
                name: "fs",
                exports: &["existsSync", "readFileSync", "writeFileSync"],
                mocked: true,
                source: "mockModule(\"fs\", { existsSync: () => false })",
            },
            Capability {
                name: "child_process",
                exports: &["exec", "spawn"],
                mocked: true,
                source: "mockModule(\"child_process\", {})",
            },
            Capability {
                name: "os",
                exports: &[],
                mocked: true,
                source: "mockModule(\"os\", {})",
            },
            Capability {
                name: "process",
                exports: &["env", "version", "versions"],
                mocked: false,
                source: "globalThis.process",
            },
        ];

        Self {
            entries: capabilities.into_iter().map(|c| (c.name, c)).collect(),
        }
    }

    /// Look up a module by import specifier, accepting the `node:` prefix
    pub fn get(&self, specifier: &str) -> Option<&Capability> {
        let name = specifier.strip_prefix("node:").unwrap_or(specifier);
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    fn definitions(&self) -> String {
        self.entries
            .values()
            .map(|c| format!("capabilities[{}] = {};\n", quote(c.name), c.source))
            .collect()
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Outbound HTTP policy for the `fetch` capability
#[derive(Debug, Clone, Default)]
pub struct NetworkPolicy {
    /// Empty means any host is reachable
    allowed_hosts: Vec<String>,
}

impl NetworkPolicy {
    pub fn allow_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }

    /// Validate if a URL is reachable under this policy
    pub fn is_url_allowed(&self, url: &str) -> bool {
        let parsed = match url::Url::parse(url) {
            Ok(u) => u,
            Err(_) => return false,
        };

        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }

        let host = match parsed.host_str() {
            Some(h) => h,
            None => return false,
        };

        if self.allowed_hosts.is_empty() {
            return true;
        }

        // Check if the host matches any allowed domain
        self.allowed_hosts
            .iter()
            .any(|domain| host == domain || host.ends_with(&format!(".{}", domain)))
    }
}

/// Everything that shapes the sandbox of one loaded artifact
#[derive(Debug, Clone, Default)]
pub struct SandboxPolicy {
    pub capabilities: CapabilityTable,
    pub network: NetworkPolicy,
}

/// Module names the artifact asked for and was refused
#[derive(Debug, Clone, Default)]
pub struct ImportLog(Arc<Mutex<Vec<String>>>);

impl ImportLog {
    pub fn record(&self, module: &str) {
        log::warn!("Sandbox denied import of `{}`", module);
        if let Ok(mut denied) = self.0.lock() {
            denied.push(module.to_string());
        }
    }

    pub fn first(&self) -> Option<String> {
        self.0.lock().ok().and_then(|denied| denied.first().cloned())
    }
}

/// Resolves ES module imports against the capability table, deny by default
pub struct CapabilityResolver {
    table: CapabilityTable,
    denied: ImportLog,
}

impl CapabilityResolver {
    pub fn new(table: CapabilityTable, denied: ImportLog) -> Self {
        Self { table, denied }
    }
}

impl Resolver for CapabilityResolver {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        match self.table.get(name) {
            Some(capability) => Ok(capability.name.to_string()),
            None => {
                self.denied.record(name);
                Err(rquickjs::Error::new_resolving_message(
                    base,
                    name,
                    "module is not linked into the artifact",
                ))
            }
        }
    }
}

/// Declares the shim module for a resolved capability
pub struct CapabilityLoader {
    table: CapabilityTable,
}

impl CapabilityLoader {
    pub fn new(table: CapabilityTable) -> Self {
        Self { table }
    }
}

impl Loader for CapabilityLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let capability = self
            .table
            .get(name)
            .ok_or_else(|| rquickjs::Error::new_loading(name))?;
        Module::declare(ctx.clone(), capability.name, capability.module_shim())
    }
}

/// Install host bindings, console, process view and capabilities
///
/// Sandboxed contexts additionally lose the globals an untrusted bundle
/// could use to reach outside the capability table.
pub fn install<'js>(
    ctx: &Ctx<'js>,
    artifact: &str,
    policy: &SandboxPolicy,
    denied: &ImportLog,
    sandboxed: bool,
) -> rquickjs::Result<()> {
    ctx.globals()
        .set("__host", host_object(ctx, artifact, policy, denied.clone())?)?;

    let bootstrap = BOOTSTRAP_JS
        .replace("{{VERSION}}", &quote(concat!("v", env!("CARGO_PKG_VERSION"))))
        .replace("{{CAPABILITIES}}", &policy.capabilities.definitions());
    eval_host::<()>(ctx, &bootstrap)?;

    if sandboxed {
        eval_host::<()>(
            ctx,
            r#"
            delete globalThis.require;
            delete globalThis.Buffer;
            delete globalThis.global;
            delete globalThis.__dirname;
            delete globalThis.__filename;
            delete globalThis.eval;
        "#,
        )?;
    }

    Ok(())
}

/// Evaluate host-side glue so its stack frames never look like artifact code
pub fn eval_host<'js, V: FromJs<'js>>(ctx: &Ctx<'js>, source: &str) -> rquickjs::Result<V> {
    ctx.eval_with_options(
        source,
        {
            let mut options = EvalOptions::default();
            options.filename = Some(HOST_SCRIPT.to_string());
            options
        },
    )
}

fn host_object<'js>(
    ctx: &Ctx<'js>,
    artifact: &str,
    policy: &SandboxPolicy,
    denied: ImportLog,
) -> rquickjs::Result<Object<'js>> {
    let host = Object::new(ctx.clone())?;

    let prefix = artifact.to_string();
    host.set(
        "write",
        Function::new(ctx.clone(), move |level: String, line: String| {
            // Output errors are ignored; a closed pipe must not fail the extension
            let _ = write_console(&mut std::io::stderr().lock(), &prefix, &level, &line);
        })?,
    )?;

    host.set(
        "deny",
        Function::new(ctx.clone(), move |module: String| denied.record(&module))?,
    )?;

    let network = policy.network.clone();
    host.set(
        "fetch",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, url: String, options: String| -> rquickjs::Result<String> {
                http_request(&network, &url, &options)
                    .map_err(|message| Exception::throw_message(&ctx, &message))
            },
        )?,
    )?;

    host.set(
        "digest",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, algorithm: String, data: String, encoding: String| -> rquickjs::Result<String> {
                digest(&algorithm, &data, &encoding)
                    .map_err(|message| Exception::throw_message(&ctx, &message))
            },
        )?,
    )?;

    host.set(
        "randomUUID",
        Function::new(ctx.clone(), || uuid::Uuid::new_v4().to_string())?,
    )?;

    host.set(
        "parseUrl",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, href: String| -> rquickjs::Result<String> {
                parse_url(&href).map_err(|message| Exception::throw_message(&ctx, &message))
            },
        )?,
    )?;

    Ok(host)
}

/// Console output goes to stderr; stdout carries the runner's JSON results
fn write_console<W: Write>(out: &mut W, prefix: &str, level: &str, line: &str) -> std::io::Result<()> {
    match level {
        "warn" | "error" => writeln!(out, "[{}] {}: {}", prefix, level, line),
        _ => writeln!(out, "[{}] {}", prefix, line),
    }
}

#[derive(Debug, Deserialize)]
struct FetchOptions {
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn http_request(network: &NetworkPolicy, url: &str, options: &str) -> Result<String, String> {
    if !network.is_url_allowed(url) {
        return Err(format!("fetch to {} is not allowed by the sandbox network policy", url));
    }

    let options: FetchOptions =
        serde_json::from_str(options).map_err(|e| format!("invalid fetch options: {}", e))?;

    log::debug!("fetch {} {}", options.method, url_for_log(url));

    let mut request = ureq::request(&options.method, url);
    for (name, value) in &options.headers {
        request = request.set(name, value);
    }

    let result = match &options.body {
        Some(body) => request.send_string(body),
        None => request.call(),
    };

    // Non-2xx responses are still responses for the extension to inspect
    let response = match result {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(e) => return Err(format!("fetch {} failed: {}", url, e)),
    };

    let status = response.status();
    let headers: BTreeMap<String, String> = response
        .headers_names()
        .into_iter()
        .filter_map(|name| response.header(&name).map(|v| (name.clone(), v.to_string())))
        .collect();

    let mut body = String::new();
    std::io::Read::read_to_string(
        &mut std::io::Read::take(response.into_reader(), MAX_RESPONSE_BYTES),
        &mut body,
    )
    .map_err(|e| format!("fetch {} failed reading body: {}", url, e))?;

    log::debug!("fetch response: status={}, body_len={}", status, body.len());

    Ok(serde_json::json!({ "status": status, "headers": headers, "body": body }).to_string())
}

/// Truncate on a character boundary; URLs come from extension code
fn url_for_log(url: &str) -> String {
    let mut shown: String = url.chars().take(MAX_LOGGED_URL_CHARS).collect();
    if shown.len() < url.len() {
        shown.push_str("...");
    }
    shown
}

fn digest(algorithm: &str, data: &str, encoding: &str) -> Result<String, String> {
    let bytes = match algorithm.to_ascii_lowercase().as_str() {
        "sha224" => Sha224::digest(data.as_bytes()).to_vec(),
        "sha256" => Sha256::digest(data.as_bytes()).to_vec(),
        "sha384" => Sha384::digest(data.as_bytes()).to_vec(),
        "sha512" => Sha512::digest(data.as_bytes()).to_vec(),
        other => return Err(format!("crypto.createHash: unsupported algorithm `{}`", other)),
    };

    match encoding {
        "hex" => Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
        "base64" => Ok(BASE64_STANDARD.encode(bytes)),
        other => Err(format!("crypto digest: unsupported encoding `{}`", other)),
    }
}

fn parse_url(href: &str) -> Result<String, String> {
    let url = url::Url::parse(href).map_err(|e| format!("invalid URL {}: {}", href, e))?;
    let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();

    Ok(serde_json::json!({
        "href": url.as_str(),
        "protocol": format!("{}:", url.scheme()),
        "hostname": url.host_str(),
        "port": url.port(),
        "pathname": url.path(),
        "search": url.query().map(|q| format!("?{}", q)),
        "hash": url.fragment().map(|f| format!("#{}", f)),
        "query": query,
    })
    .to_string())
}

fn quote(s: &str) -> String {
    serde_json::Value::from(s).to_string()
}

const CRYPTO_JS: &str = r#"({
    randomUUID: () => host.randomUUID(),
    createHash: (algorithm) => {
        const chunks = [];
        const hash = {
            update(data) { chunks.push(String(data)); return hash; },
            digest(encoding) { return host.digest(String(algorithm), chunks.join(""), encoding || "hex"); }
        };
        return hash;
    }
})"#;

const BOOTSTRAP_JS: &str = r#"
(function () {
    const host = globalThis.__host;
    delete globalThis.__host;

    const describe = (value) => {
        if (typeof value === "string") return value;
        if (value instanceof Error) return value.stack ? value.message + "\n" + value.stack : String(value);
        try {
            const json = JSON.stringify(value);
            return json === undefined ? String(value) : json;
        } catch (e) {
            return String(value);
        }
    };
    const formatArgs = (args) => args.map(describe).join(" ");

    globalThis.console = {
        log: (...args) => host.write("log", formatArgs(args)),
        info: (...args) => host.write("info", formatArgs(args)),
        debug: (...args) => host.write("debug", formatArgs(args)),
        warn: (...args) => host.write("warn", formatArgs(args)),
        error: (...args) => host.write("error", formatArgs(args)),
    };

    globalThis.process = Object.freeze({
        env: Object.freeze({}),
        version: {{VERSION}},
        versions: Object.freeze({ runner: {{VERSION}} }),
    });

    globalThis.fetch = async function (input, init) {
        const opts = init || {};
        const headers = {};
        for (const [name, value] of Object.entries(opts.headers || {})) headers[name] = String(value);
        const raw = JSON.parse(host.fetch(String(input), JSON.stringify({
            method: String(opts.method || "GET").toUpperCase(),
            headers,
            body: opts.body === undefined || opts.body === null ? null : String(opts.body),
        })));
        return {
            status: raw.status,
            ok: raw.status >= 200 && raw.status < 300,
            headers: {
                get: (name) => {
                    const key = Object.keys(raw.headers).find((h) => h.toLowerCase() === String(name).toLowerCase());
                    return key === undefined ? null : raw.headers[key];
                },
            },
            text: async () => raw.body,
            json: async () => JSON.parse(raw.body),
        };
    };

    const mockModule = (name, members) => new Proxy(members, {
        get(target, prop) {
            if (prop in target) return target[prop];
            if (typeof prop === "symbol" || prop === "then" || prop === "default" || prop === "__esModule") return undefined;
            return function () {
                throw new Error(name + "." + String(prop) + " is not available inside the sandbox");
            };
        },
    });

    const capabilities = Object.create(null);
    {{CAPABILITIES}}

    globalThis.__require = function (specifier) {
        const name = String(specifier);
        const key = name.startsWith("node:") ? name.slice(5) : name;
        if (!(key in capabilities)) {
            host.deny(name);
            throw new Error("Cannot require module '" + name + "': it is not linked into the artifact and the sandbox does not provide it");
        }
        return capabilities[key];
    };
})();
"#;
