//! `eoka::Page` adapters for the capability traits.
//!
//! Locators understood here are live patterns: `css:`, `text:`,
//! `placeholder:`, `role:` and `id:` prefixes. An unprefixed locator is a CSS
//! selector, which is also what [`PageDriver`] records for accepted candidates.

use crate::driver::{ChangeEvent, ChangeFeed, Driver, Heuristic, HeuristicMatch, Subscription, TextSource};
use crate::model::{LiveCandidate, Locator, ResolutionKey};
use crate::{Error, Result};
use async_trait::async_trait;
use eoka::Page;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Parsed form of a page locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Css(String),
    Text(String),
    Placeholder(String),
    Role(String),
    Id(String),
}

impl Pattern {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if let Some(v) = s.strip_prefix("css:") {
            return Pattern::Css(v.trim().into());
        }
        if let Some(v) = s.strip_prefix("text:") {
            return Pattern::Text(v.trim().into());
        }
        if let Some(v) = s.strip_prefix("placeholder:") {
            return Pattern::Placeholder(v.trim().into());
        }
        if let Some(v) = s.strip_prefix("role:") {
            return Pattern::Role(v.trim().into());
        }
        if let Some(v) = s.strip_prefix("id:") {
            return Pattern::Id(v.trim().into());
        }
        Pattern::Css(s.into())
    }

    fn as_js_args(&self) -> (&'static str, &str) {
        match self {
            Pattern::Css(v) => ("css", v),
            Pattern::Text(v) => ("text", v),
            Pattern::Placeholder(v) => ("placeholder", v),
            Pattern::Role(v) => ("role", v),
            Pattern::Id(v) => ("id", v),
        }
    }
}

fn js_str(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

#[derive(Debug, Deserialize)]
struct Located {
    found: bool,
    #[serde(default)]
    syntax_error: Option<String>,
    #[serde(default)]
    candidate: Option<LiveCandidate>,
}

const LOCATE_JS: &str = r#"
((type, value, scopeType, scopeValue) => {
    const lc = s => (s || '').toLowerCase().trim();

    function selector(el) {
        if (el.id) return '#' + CSS.escape(el.id);
        const path = [];
        let n = el;
        while (n && n.nodeType === 1) {
            let s = n.tagName.toLowerCase();
            if (n.id) { path.unshift('#' + CSS.escape(n.id)); break; }
            const p = n.parentElement;
            if (p) {
                const sibs = [...p.children].filter(c => c.tagName === n.tagName);
                if (sibs.length > 1) s += ':nth-of-type(' + (sibs.indexOf(n) + 1) + ')';
            }
            path.unshift(s);
            n = p;
        }
        return path.join(' > ');
    }

    function visible(el) {
        const r = el.getBoundingClientRect();
        const s = getComputedStyle(el);
        return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
    }

    function label(el) {
        return el.getAttribute('aria-label') || el.title || '';
    }

    function find(root, type, value) {
        const v = lc(value);
        const all = sel => [...root.querySelectorAll(sel)];
        switch (type) {
            case 'css': return root.querySelector(value);
            case 'id': return root.querySelector('#' + CSS.escape(value));
            case 'placeholder':
                return all('input,textarea,[contenteditable],[placeholder],[data-placeholder]')
                    .find(e => lc(e.placeholder || e.getAttribute('data-placeholder')).includes(v));
            case 'role':
                return all(`[role="${CSS.escape(value)}"]`)[0]
                    || all(v.replace(/[^a-z0-9-]/g, '') || '*').find(visible) || null;
            case 'text':
                return all('a,button,input,select,textarea,[role],[contenteditable],[aria-label],div,span,p')
                    .filter(visible)
                    .find(e => lc(e.innerText || e.value || label(e)).includes(v)) || null;
        }
        return null;
    }

    function features(n) {
        const cls = [...(n.classList || [])].filter(c => !/\d{3,}|^css-|^_/.test(c)).slice(0, 3);
        return {
            tag: n.tagName.toLowerCase(),
            stable_id: n.getAttribute('data-testid') || n.id || null,
            role: n.getAttribute('role'),
            label_hint: n.getAttribute('aria-label'),
            class_hints: cls,
        };
    }

    try {
        let root = document;
        if (scopeType) {
            root = find(document, scopeType, scopeValue);
            if (!root) return { found: false };
        }
        const el = find(root, type, value);
        if (!el) return { found: false };

        const ancestry = [];
        for (let n = el; n && n.nodeType === 1 && ancestry.length < 3; n = n.parentElement) {
            ancestry.push(features(n));
        }
        const attributes = {};
        for (const a of el.attributes) attributes[a.name] = a.value;
        return {
            found: true,
            candidate: {
                locator: selector(el),
                ancestry,
                text: (el.innerText || el.value || '').trim().slice(0, 2000),
                label: label(el) || null,
                placeholder: el.placeholder || el.getAttribute('data-placeholder') || null,
                attributes,
            },
        };
    } catch (e) {
        if (e instanceof DOMException && e.name === 'SyntaxError') return { found: false, syntax_error: e.message };
        throw e;
    }
})
"#;

const VALIDATE_JS: &str = r#"
((sel) => {
    const el = document.querySelector(sel);
    if (!el || !el.isConnected) return false;
    const r = el.getBoundingClientRect();
    const s = getComputedStyle(el);
    if (r.width <= 0 || r.height <= 0 || s.visibility === 'hidden' || s.display === 'none') return false;
    if (el.disabled || el.getAttribute('aria-disabled') === 'true') return false;
    return !el.closest('[inert],[aria-hidden="true"]');
})
"#;

const SNAPSHOT_JS: &str = r#"
(() => ({
    url: location.href,
    title: document.title,
    ready_state: document.readyState,
    nodes: document.getElementsByTagName('*').length,
}))()
"#;

/// [`Driver`] over a live `eoka::Page`.
#[derive(Clone)]
pub struct PageDriver {
    page: Arc<Page>,
}

impl PageDriver {
    pub fn new(page: Arc<Page>) -> Self {
        Self { page }
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

/// Run the locate script for `pattern`, optionally inside `scope`.
async fn locate_on(page: &Page, pattern: &Pattern, scope: Option<&Pattern>) -> Result<Option<LiveCandidate>> {
    let (t, v) = pattern.as_js_args();
    let (st, sv) = scope.map(Pattern::as_js_args).unwrap_or(("", ""));
    let js = format!("{}({},{},{},{})", LOCATE_JS, js_str(t), js_str(v), js_str(st), js_str(sv));
    let located: Located = page.evaluate(&js).await?;
    if let Some(msg) = located.syntax_error {
        return Err(Error::InvalidLocatorSyntax(format!("{}:{}: {}", t, v, msg)));
    }
    Ok(if located.found { located.candidate } else { None })
}

#[async_trait]
impl Driver for PageDriver {
    async fn locate(&self, locator: &Locator, scope: Option<&Locator>) -> Result<Option<LiveCandidate>> {
        let pattern = Pattern::parse(locator.as_str());
        let scope = scope.map(|s| Pattern::parse(s.as_str()));
        locate_on(&self.page, &pattern, scope.as_ref()).await
    }

    async fn validate(&self, key: &ResolutionKey, candidate: &LiveCandidate) -> bool {
        let sel = match Pattern::parse(candidate.locator.as_str()) {
            Pattern::Css(sel) => sel,
            other => {
                debug!("{}: cannot validate non-css locator {:?}", key, other);
                return false;
            }
        };
        let js = format!("{}({})", VALIDATE_JS, js_str(&sel));
        self.page.evaluate::<bool>(&js).await.unwrap_or(false)
    }

    async fn snapshot(&self) -> Option<serde_json::Value> {
        self.page.evaluate::<serde_json::Value>(SNAPSHOT_JS).await.ok()
    }
}

/// Heuristic that tries a fixed list of live patterns in order.
pub struct PatternHeuristic {
    name: String,
    page: Arc<Page>,
    patterns: Vec<Pattern>,
}

impl PatternHeuristic {
    pub fn new<I, S>(name: impl Into<String>, page: Arc<Page>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: name.into(),
            page,
            patterns: patterns.into_iter().map(|p| Pattern::parse(p.as_ref())).collect(),
        }
    }
}

/// Patterns to try for one pass: a non-blank hint first, as visible text.
fn plan(patterns: &[Pattern], hint: Option<&str>) -> Vec<Pattern> {
    let hint = hint.map(str::trim).filter(|h| !h.is_empty());
    let mut out = Vec::with_capacity(patterns.len() + usize::from(hint.is_some()));
    if let Some(hint) = hint {
        out.push(Pattern::Text(hint.to_string()));
    }
    out.extend(patterns.iter().cloned());
    out
}

#[async_trait]
impl Heuristic for PatternHeuristic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_locate(&self, key: &ResolutionKey, hint: Option<&str>) -> Result<Option<HeuristicMatch>> {
        for pattern in plan(&self.patterns, hint) {
            match locate_on(&self.page, &pattern, None).await {
                Ok(Some(candidate)) => return Ok(Some(HeuristicMatch::bare(candidate))),
                Ok(None) => {}
                Err(Error::InvalidLocatorSyntax(msg)) => debug!("{}: skipping {}", key, msg),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

/// Reads `innerText` of the scope element.
pub struct PageText {
    page: Arc<Page>,
}

impl PageText {
    pub fn new(page: Arc<Page>) -> Self {
        Self { page }
    }
}

#[async_trait]
impl TextSource for PageText {
    async fn extract(&self, scope: &Locator) -> Result<Option<String>> {
        Ok(locate_on(&self.page, &Pattern::parse(scope.as_str()), None)
            .await?
            .map(|c| c.text)
            .filter(|t| !t.trim().is_empty()))
    }
}

const OBSERVE_JS: &str = r#"
((id, sel) => {
    const store = window.__eokaMutations = window.__eokaMutations || {};
    const target = sel ? document.querySelector(sel) : document.body;
    if (!target) { store[id] = { count: 0 }; return false; }
    const entry = store[id] = { count: 0 };
    entry.observer = new MutationObserver(() => { entry.count += 1; });
    entry.observer.observe(target, { subtree: true, childList: true, characterData: true, attributes: true });
    return true;
})
"#;

const POLL_JS: &str = r#"
((id) => {
    const e = (window.__eokaMutations || {})[id];
    if (!e) return 0;
    const n = e.count;
    e.count = 0;
    return n;
})
"#;

const DISCONNECT_JS: &str = r#"
((id) => {
    const store = window.__eokaMutations || {};
    if (store[id] && store[id].observer) store[id].observer.disconnect();
    delete store[id];
})
"#;

static NEXT_OBSERVER: AtomicU64 = AtomicU64::new(1);

/// [`ChangeFeed`] backed by a `MutationObserver` that a background task polls.
pub struct PageMutations {
    page: Arc<Page>,
    poll_interval: Duration,
}

impl PageMutations {
    pub fn new(page: Arc<Page>) -> Self {
        Self {
            page,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl ChangeFeed for PageMutations {
    fn subscribe(&self, scope: &Locator) -> Subscription {
        let id = format!("o{}", NEXT_OBSERVER.fetch_add(1, Ordering::Relaxed));
        let sel = match Pattern::parse(scope.as_str()) {
            Pattern::Css(sel) => sel,
            Pattern::Id(id) => format!("[id={}]", js_str(&id)),
            _ => String::new(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let page = self.page.clone();
        let every = self.poll_interval;

        let task = tokio::spawn(async move {
            let install = format!("{}({},{})", OBSERVE_JS, js_str(&id), js_str(&sel));
            if let Err(e) = page.execute(&install).await {
                debug!("MutationObserver install failed: {}", e);
                return;
            }
            let poll = format!("{}({})", POLL_JS, js_str(&id));
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match page.evaluate::<u64>(&poll).await {
                    Ok(0) => {}
                    Ok(_) => {
                        if tx.send(ChangeEvent).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Mutation poll failed: {}", e);
                        break;
                    }
                }
            }
            let _ = page.execute(&format!("{}({})", DISCONNECT_JS, js_str(&id))).await;
        });

        Subscription::new(rx, move || task.abort())
    }
}
