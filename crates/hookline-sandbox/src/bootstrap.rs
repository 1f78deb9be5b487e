//! Bootstrap JavaScript evaluated in every fresh isolate before user code.
//!
//! It captures the ops in closures, builds the only surface a script can see
//! (`__request`, `__response`, `require`, `console`, `setTimeout`,
//! `clearTimeout`, `Buffer`, the two hook entry points), and then removes
//! `Deno`, `eval` and the function constructors.

use serde_json::json;

use crate::actions;
use crate::modules::{PreparedModules, PROXY_MODULE};
use crate::types::{ContextMeta, ResponseSnapshot};

/// Script name for the bootstrap. Frames from it are dropped from stacks.
pub(crate) const BOOTSTRAP_NAME: &str = "[hookline:bootstrap]";
/// Script name for module registration.
pub(crate) const MODULE_SCRIPT_NAME: &str = "module.js";
/// Script name for user code.
pub(crate) const USER_SCRIPT_NAME: &str = "script.js";
/// Script name for engine-issued snippets (seal, snapshot).
pub(crate) const INTERNAL_NAME: &str = "[hookline:internal]";

const INIT_PLACEHOLDER: &str = "__HOOKLINE_INIT__";

/// Assemble the bootstrap for one execution.
pub(crate) fn build_bootstrap(
    request: &serde_json::Value,
    response: &ResponseSnapshot,
    proxy_actions: &[String],
    modules: &PreparedModules,
    context_meta: &ContextMeta,
) -> Result<String, serde_json::Error> {
    let init = json!({
        "request": request,
        "response": response,
        "actions": proxy_actions,
        "modules": { "graph": modules.graph, "fallback": modules.fallback },
        "contextMeta": { "readOnly": context_meta.read_only },
        "proxyModule": PROXY_MODULE,
        "builtins": {
            "render": actions::RENDER,
            "find": actions::FIND,
            "findOne": actions::FIND_ONE,
        },
    });
    let init_json = serde_json::to_string(&init)?;
    Ok(BOOTSTRAP_JS.replacen(INIT_PLACEHOLDER, &init_json, 1))
}

/// Wrap a module source into a factory registration call.
pub(crate) fn module_registration(key: &str, source: &str) -> Result<String, serde_json::Error> {
    let key_json = serde_json::to_string(key)?;
    Ok(format!(
        "__hooklineDefine({key_json}, function (module, exports, require, __filename, __dirname) {{\n{source}\n}});"
    ))
}

/// Append the hook trigger to user code.
pub(crate) fn with_trigger(script: &str, entry_point: &str) -> String {
    format!(
        "{script}\n;{entry_point}(typeof beforeRender === 'function' ? beforeRender : undefined, \
         typeof afterRender === 'function' ? afterRender : undefined);\n"
    )
}

pub(crate) const SEAL_JS: &str = "globalThis.__hooklineSeal();";
pub(crate) const SNAPSHOT_JS: &str = "globalThis.__hooklineSnapshot();";

const BOOTSTRAP_JS: &str = r#"
((ops, core, init) => {
    'use strict';
    const logOp = ops.op_hookline_log;
    const setResultOp = ops.op_hookline_set_result;
    const setSnapshotOp = ops.op_hookline_set_snapshot;
    const cancelOp = ops.op_hookline_cancel;
    const hooksOp = ops.op_hookline_hooks;
    const moduleFailedOp = ops.op_hookline_module_failed;
    const sleepOp = ops.op_hookline_sleep;
    const proxyCallOp = ops.op_hookline_proxy_call;
    const encodeUtf8 = (text) => core.encode(text);
    const decodeUtf8 = (bytes) => core.decode(bytes);
    const hasOwn = (obj, key) => Object.prototype.hasOwnProperty.call(obj, key);

    const install = (name, value, configurable) => {
        try {
            Object.defineProperty(globalThis, name, {
                value, writable: false, enumerable: false, configurable: !!configurable,
            });
        } catch (_) {
            globalThis[name] = value;
        }
    };

    // --- Buffer ---
    const HEX = '0123456789abcdef';
    const B64 = 'ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/';

    const toBase64 = (bytes) => {
        let out = '';
        let i = 0;
        for (; i + 2 < bytes.length; i += 3) {
            const n = (bytes[i] << 16) | (bytes[i + 1] << 8) | bytes[i + 2];
            out += B64[(n >> 18) & 63] + B64[(n >> 12) & 63] + B64[(n >> 6) & 63] + B64[n & 63];
        }
        const rest = bytes.length - i;
        if (rest === 1) {
            const n = bytes[i] << 16;
            out += B64[(n >> 18) & 63] + B64[(n >> 12) & 63] + '==';
        } else if (rest === 2) {
            const n = (bytes[i] << 16) | (bytes[i + 1] << 8);
            out += B64[(n >> 18) & 63] + B64[(n >> 12) & 63] + B64[(n >> 6) & 63] + '=';
        }
        return out;
    };

    const fromBase64 = (text) => {
        const out = [];
        let acc = 0;
        let bits = 0;
        for (const ch of text) {
            const idx = B64.indexOf(ch);
            if (idx < 0) continue;
            acc = ((acc << 6) | idx) & 0xffffff;
            bits += 6;
            if (bits >= 8) {
                bits -= 8;
                out.push((acc >> bits) & 255);
            }
        }
        return Uint8Array.from(out);
    };

    const isBufferShape = (v) =>
        v !== null && typeof v === 'object' && v.type === 'Buffer' && Array.isArray(v.data);

    class Buffer extends Uint8Array {
        static from(value, encoding) {
            if (typeof value === 'string') return fromString(value, encoding);
            if (value instanceof ArrayBuffer) return wrap(new Uint8Array(value.slice(0)));
            if (ArrayBuffer.isView(value)) {
                return wrap(new Uint8Array(
                    value.buffer.slice(value.byteOffset, value.byteOffset + value.byteLength)));
            }
            if (Array.isArray(value)) return wrap(Uint8Array.from(value));
            if (isBufferShape(value)) return wrap(Uint8Array.from(value.data));
            throw new TypeError(
                'The first argument must be a string, Buffer, ArrayBuffer, Array, or array-like object');
        }
        static alloc(size, fill) {
            const buf = new Buffer(size);
            if (typeof fill === 'number') buf.fill(fill);
            return buf;
        }
        static isBuffer(value) {
            return value instanceof Buffer;
        }
        static byteLength(value, encoding) {
            return typeof value === 'string' ? fromString(value, encoding).length : value.byteLength;
        }
        static concat(list) {
            const total = list.reduce((n, b) => n + b.length, 0);
            const out = new Buffer(total);
            let offset = 0;
            for (const b of list) {
                out.set(b, offset);
                offset += b.length;
            }
            return out;
        }
        toString(encoding) {
            const bytes = new Uint8Array(this.buffer, this.byteOffset, this.byteLength);
            switch (encoding) {
                case 'hex': {
                    let s = '';
                    for (const b of bytes) s += HEX[b >> 4] + HEX[b & 15];
                    return s;
                }
                case 'latin1':
                case 'binary': {
                    let s = '';
                    for (const b of bytes) s += String.fromCharCode(b);
                    return s;
                }
                case 'base64':
                    return toBase64(bytes);
                default:
                    return decodeUtf8(bytes);
            }
        }
        equals(other) {
            if (!(other instanceof Uint8Array) || other.length !== this.length) return false;
            for (let i = 0; i < this.length; i++) if (this[i] !== other[i]) return false;
            return true;
        }
        toJSON() {
            return { type: 'Buffer', data: Array.from(this) };
        }
    }

    const wrap = (u8) => new Buffer(u8.buffer, u8.byteOffset, u8.byteLength);

    const fromString = (text, encoding) => {
        switch (encoding) {
            case 'hex': {
                const out = new Buffer(text.length >> 1);
                for (let i = 0; i < out.length; i++) out[i] = parseInt(text.slice(i * 2, i * 2 + 2), 16);
                return out;
            }
            case 'latin1':
            case 'binary': {
                const out = new Buffer(text.length);
                for (let i = 0; i < text.length; i++) out[i] = text.charCodeAt(i) & 255;
                return out;
            }
            case 'base64':
                return wrap(fromBase64(text));
            default:
                return wrap(encodeUtf8(text));
        }
    };

    const restoreBuffers = (value) => {
        if (isBufferShape(value)) return Buffer.from(value.data);
        if (Array.isArray(value)) {
            for (let i = 0; i < value.length; i++) value[i] = restoreBuffers(value[i]);
            return value;
        }
        if (value !== null && typeof value === 'object') {
            for (const key of Object.keys(value)) value[key] = restoreBuffers(value[key]);
        }
        return value;
    };

    const binaryReplacer = (_key, value) => {
        if (value instanceof ArrayBuffer) {
            return { type: 'Buffer', data: Array.from(new Uint8Array(value)) };
        }
        if (ArrayBuffer.isView(value) && !(value instanceof DataView)) {
            return {
                type: 'Buffer',
                data: Array.from(new Uint8Array(value.buffer, value.byteOffset, value.byteLength)),
            };
        }
        return value;
    };

    // --- console ---
    const inspect = (value) => {
        if (typeof value === 'string') return value;
        if (value instanceof Error) return value.stack || `${value.name}: ${value.message}`;
        if (typeof value === 'function') return `[Function: ${value.name || 'anonymous'}]`;
        if (value === undefined) return 'undefined';
        if (typeof value === 'bigint') return `${value}n`;
        if (typeof value === 'symbol') return value.toString();
        try {
            const text = JSON.stringify(value, binaryReplacer);
            return text === undefined ? String(value) : text;
        } catch (_) {
            return Object.prototype.toString.call(value);
        }
    };

    const console = {};
    for (const level of ['log', 'info', 'warn', 'error', 'debug', 'trace']) {
        console[level] = (...args) => logOp(level, args.map(inspect).join(' '));
    }
    Object.freeze(console);

    // --- request / response ---
    const request = restoreBuffers(init.request !== null && typeof init.request === 'object' ? init.request : {});
    if (request.context === null || typeof request.context !== 'object') request.context = {};

    const deepFreeze = (obj) => {
        for (const v of Object.values(obj)) {
            if (v !== null && (typeof v === 'object' || typeof v === 'function') && !ArrayBuffer.isView(v)) {
                deepFreeze(v);
            }
        }
        return Object.freeze(obj);
    };

    for (const field of init.contextMeta.readOnly) {
        if (!hasOwn(request.context, field)) continue;
        let value = request.context[field];
        if (value !== null && typeof value === 'object' && !ArrayBuffer.isView(value)) {
            value = deepFreeze(value);
        }
        Object.defineProperty(request.context, field, {
            value, writable: false, enumerable: true, configurable: false,
        });
    }

    const response = {
        content: Buffer.from(init.response.content),
        meta: restoreBuffers(init.response.meta || {}),
    };

    // --- completion ---
    let settled = false;
    const moduleErrors = new WeakSet();

    const contentBytes = (content) => {
        if (content === undefined || content === null) return [];
        if (typeof content === 'string') return Array.from(encodeUtf8(content));
        if (content instanceof ArrayBuffer) return Array.from(new Uint8Array(content));
        if (ArrayBuffer.isView(content)) {
            return Array.from(new Uint8Array(content.buffer, content.byteOffset, content.byteLength));
        }
        if (isBufferShape(content)) return content.data;
        return Array.from(encodeUtf8(String(content)));
    };

    const captureState = () => ({
        request,
        response: {
            content: { type: 'Buffer', data: contentBytes(response.content) },
            meta: response.meta !== null && typeof response.meta === 'object' ? response.meta : {},
        },
    });

    const describeFailure = (err) => {
        if (err instanceof Error) {
            return {
                message: String(err.message),
                stack: typeof err.stack === 'string' ? err.stack : null,
                kind: moduleErrors.has(err) ? 'module' : 'thrown',
            };
        }
        let shown;
        try {
            shown = typeof err === 'string' ? err : JSON.stringify(err);
        } catch (_) {
            shown = undefined;
        }
        if (shown === undefined) shown = String(err);
        return { message: `Script threw with non-Error value: ${shown}`, stack: null, kind: 'non_error' };
    };

    const settle = (failed, err) => {
        if (settled) return;
        settled = true;
        let payload;
        try {
            payload = JSON.stringify(
                { ...captureState(), error: failed ? describeFailure(err) : null }, binaryReplacer);
        } catch (e) {
            payload = JSON.stringify({
                request: null,
                response: null,
                error: {
                    message: `Script state could not be serialized: ${e && e.message}`,
                    stack: null,
                    kind: 'thrown',
                },
            });
        }
        setResultOp(payload);
    };

    Object.defineProperty(request, 'cancel', {
        enumerable: false,
        value: (arg) => {
            let message = null;
            let statusCode = null;
            if (typeof arg === 'string') {
                message = arg;
            } else if (arg !== null && typeof arg === 'object') {
                if (arg.message !== undefined && arg.message !== null) message = String(arg.message);
                const code = arg.statusCode;
                if (Number.isInteger(code) && code >= 100 && code <= 599) statusCode = code;
            } else if (arg !== undefined && arg !== null) {
                message = String(arg);
            }
            cancelOp(JSON.stringify({ message, status_code: statusCode }));
            settle(false);
        },
    });

    // --- timers ---
    let nextTimer = 1;
    const liveTimers = new Set();
    const setTimeout = (fn, ms, ...args) => {
        const id = nextTimer++;
        liveTimers.add(id);
        const delay = Math.min(Math.max(0, Math.floor(Number(ms) || 0)), 0x7fffffff);
        sleepOp(delay).then(() => {
            if (!liveTimers.delete(id) || typeof fn !== 'function') return;
            try {
                fn(...args);
            } catch (err) {
                settle(true, err);
            }
        });
        return id;
    };
    const clearTimeout = (id) => {
        liveTimers.delete(id);
    };

    // --- proxy ---
    const callProxy = async (action, payload) => {
        const json = await proxyCallOp(
            action, JSON.stringify(payload === undefined ? null : payload, binaryReplacer));
        return restoreBuffers(JSON.parse(json));
    };

    const replaceContents = (target, source) => {
        for (const key of Object.keys(target)) delete target[key];
        Object.assign(target, source);
    };

    const { render: RENDER, find: FIND, findOne: FIND_ONE } = init.builtins;
    const proxy = {};

    if (init.actions.includes(RENDER)) {
        proxy.render = async (nested) => {
            const ctx = request.context;
            const payload = { request: nested === undefined || nested === null ? {} : nested };
            if (ctx.shared !== undefined) payload.shared = ctx.shared;
            const result = await callProxy(RENDER, payload);
            if (result !== null && typeof result === 'object' && hasOwn(result, 'shared')) {
                const current = ctx.shared;
                const next = result.shared;
                try {
                    if (current !== null && typeof current === 'object' && !Array.isArray(current)
                        && next !== null && typeof next === 'object' && !Array.isArray(next)) {
                        replaceContents(current, next);
                    } else {
                        ctx.shared = next;
                    }
                } catch (_) {
                    // read-only shared context stays as it was
                }
            }
            return { content: result.content, meta: result.meta };
        };
    }

    if (init.actions.includes(FIND) || init.actions.includes(FIND_ONE)) {
        proxy.documentStore = {
            collection: (name) => ({
                find: (filter) =>
                    callProxy(FIND, { collection: String(name), filter: filter === undefined ? {} : filter }),
                findOne: (filter) =>
                    callProxy(FIND_ONE, { collection: String(name), filter: filter === undefined ? {} : filter }),
            }),
        };
    }

    const UNSAFE_SEGMENTS = new Set(['__proto__', 'prototype', 'constructor']);
    for (const action of init.actions) {
        if (action === RENDER || action === FIND || action === FIND_ONE) continue;
        const path = action.split('.');
        if (path.some((segment) => segment === '' || UNSAFE_SEGMENTS.has(segment))) continue;
        let target = proxy;
        for (const segment of path.slice(0, -1)) {
            if (!hasOwn(target, segment)) target[segment] = {};
            target = target[segment];
            if (target === null || (typeof target !== 'object' && typeof target !== 'function')) break;
        }
        const leaf = path[path.length - 1];
        if (target !== null && typeof target === 'object' && !hasOwn(target, leaf)) {
            target[leaf] = (payload) => callProxy(action, payload);
        }
    }
    deepFreeze(proxy);

    // --- require ---
    const factories = new Map();
    const moduleCache = new Map();
    let sealed = false;

    const moduleError = (name, message) => {
        moduleFailedOp(name);
        const err = new Error(message);
        moduleErrors.add(err);
        return err;
    };

    const dirname = (path) => {
        const i = Math.max(path.lastIndexOf('/'), path.lastIndexOf('\\'));
        return i > 0 ? path.slice(0, i) : path;
    };

    const load = (key) => {
        const cached = moduleCache.get(key);
        if (cached) return cached.exports;
        const factory = factories.get(key);
        if (typeof factory !== 'function') throw moduleError(key, `Module '${key}' was not preloaded`);
        const module = { exports: {}, id: key, filename: key };
        moduleCache.set(key, module);
        try {
            factory.call(module.exports, module, module.exports, makeRequire(key), key, dirname(key));
        } catch (err) {
            moduleCache.delete(key);
            throw err;
        }
        return module.exports;
    };

    const makeRequire = (fromKey) => (name) => {
        name = String(name);
        if (name === init.proxyModule) return proxy;
        const edges = hasOwn(init.modules.graph, fromKey) ? init.modules.graph[fromKey] : {};
        if (!hasOwn(edges, name)) {
            throw moduleError(name, `Unsupported module in scripts: '${name}'. ${init.modules.fallback}`);
        }
        const edge = edges[name];
        if (edge.error) throw moduleError(name, edge.error);
        return load(edge.key);
    };

    // --- hook entry points ---
    const invoke = (fn) => {
        if (typeof fn !== 'function') {
            settle(false);
            return;
        }
        try {
            if (fn.length >= 3) {
                const done = (err) => {
                    if (err === undefined || err === null) settle(false);
                    else settle(true, err);
                };
                const ret = fn(request, response, done);
                if (ret !== null && typeof ret === 'object' && typeof ret.then === 'function') {
                    ret.then(undefined, (err) => settle(true, err));
                }
            } else {
                Promise.resolve(fn(request, response)).then(
                    () => settle(false), (err) => settle(true, err));
            }
        } catch (err) {
            settle(true, err);
        }
    };

    let triggered = false;
    const trigger = (pick) => (before, after) => {
        if (triggered) return;
        triggered = true;
        hooksOp(typeof before === 'function', typeof after === 'function');
        invoke(pick(before, after));
    };

    install('__request', request);
    install('__response', response);
    install('require', makeRequire(''));
    install('console', console);
    install('setTimeout', setTimeout);
    install('clearTimeout', clearTimeout);
    install('Buffer', Buffer);
    install('__runBeforeHook', trigger((before) => before));
    install('__runAfterHook', trigger((_before, after) => after));
    install('__hooklineSnapshot', () => setSnapshotOp(JSON.stringify(captureState(), binaryReplacer)));
    install('__hooklineDefine', (key, factory) => {
        if (!sealed && typeof factory === 'function') factories.set(String(key), factory);
    }, true);
    install('__hooklineSeal', () => {
        sealed = true;
        delete globalThis.__hooklineDefine;
        delete globalThis.__hooklineSeal;
    }, true);

    delete globalThis.Deno;

    // Remove code generation primitives reachable through the prototype chain.
    delete globalThis.eval;
    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    Object.defineProperty(Function.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false,
    });
    Object.defineProperty(AsyncFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false,
    });
    Object.defineProperty(GeneratorFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false,
    });
})(Deno.core.ops, Deno.core, __HOOKLINE_INIT__);
"#;
