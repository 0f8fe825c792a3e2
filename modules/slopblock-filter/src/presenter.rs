//! Presentation state machine: Expanded <-> Collapsed per node.
//!
//! The node's own `data-slop-state` attribute is the guard, so entering the
//! current state again is a no-op. In `Collapse` mode the original markup is
//! kept here and written back verbatim on restore; `Blur` and `Hide` only
//! toggle a class on the node.

use std::collections::HashMap;

use tracing::debug;

use slopblock_common::FilterMode;

use crate::dom::{NodeKey, NodeRef};

pub const STATE_ATTR: &str = "data-slop-state";
pub const ID_ATTR: &str = "data-slop-id";
/// On the node after a user restore (`recollapse`) and on the summary's
/// restore control (`restore`).
pub const ACTION_ATTR: &str = "data-slop-action";

const COLLAPSED: &str = "collapsed";
const RECOLLAPSE: &str = "recollapse";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    AlreadyInState,
}

#[derive(Debug)]
struct Suppressed {
    node: NodeRef,
    identifier: String,
    reasons: Vec<String>,
    mode: FilterMode,
    /// Original inner markup, for `Collapse` mode.
    markup: Option<String>,
}

#[derive(Debug, Default)]
pub struct Presenter {
    mode: FilterMode,
    suppressed: HashMap<NodeKey, Suppressed>,
}

impl Presenter {
    pub fn new(mode: FilterMode) -> Self {
        Self {
            mode,
            suppressed: HashMap::new(),
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn is_collapsed(node: &NodeRef) -> bool {
        node.attr(STATE_ATTR).as_deref() == Some(COLLAPSED)
    }

    pub fn collapse(&mut self, node: &NodeRef, identifier: &str, reasons: &[String]) -> Transition {
        if Self::is_collapsed(node) {
            return Transition::AlreadyInState;
        }

        let markup = match self.mode.css_class() {
            None => {
                let original = node.markup();
                node.set_markup(&summary_markup(reasons));
                Some(original)
            }
            Some(class) => {
                add_class(node, class);
                None
            }
        };

        node.set_attr(STATE_ATTR, COLLAPSED);
        node.set_attr(ID_ATTR, identifier);
        node.remove_attr(ACTION_ATTR);

        self.suppressed.insert(
            node.key(),
            Suppressed {
                node: node.clone(),
                identifier: identifier.to_string(),
                reasons: reasons.to_vec(),
                mode: self.mode,
                markup,
            },
        );
        debug!(identifier, mode = ?self.mode, "Collapsed");
        Transition::Applied
    }

    pub fn restore(&mut self, node: &NodeRef) -> Transition {
        if !Self::is_collapsed(node) {
            return Transition::AlreadyInState;
        }

        match self.suppressed.remove(&node.key()) {
            Some(entry) => undo(node, &entry),
            None => debug!(key = node.key(), "Restoring node with no stored original"),
        }

        node.remove_attr(STATE_ATTR);
        node.set_attr(ACTION_ATTR, RECOLLAPSE);
        Transition::Applied
    }

    /// Restore every node still attached. Returns how many were restored.
    pub fn restore_all(&mut self) -> usize {
        let entries: Vec<Suppressed> = self.suppressed.drain().map(|(_, e)| e).collect();
        let mut restored = 0;
        for entry in entries {
            if !entry.node.is_connected() {
                continue;
            }
            undo(&entry.node, &entry);
            entry.node.remove_attr(STATE_ATTR);
            entry.node.remove_attr(ID_ATTR);
            restored += 1;
        }
        restored
    }

    /// Re-render every collapsed node under `mode`.
    pub fn switch_mode(&mut self, mode: FilterMode) -> usize {
        if mode == self.mode {
            return 0;
        }
        let entries: Vec<Suppressed> = self.suppressed.drain().map(|(_, e)| e).collect();
        self.mode = mode;

        let mut switched = 0;
        for entry in entries {
            if !entry.node.is_connected() {
                continue;
            }
            undo(&entry.node, &entry);
            entry.node.remove_attr(STATE_ATTR);
            self.collapse(&entry.node, &entry.identifier, &entry.reasons);
            switched += 1;
        }
        switched
    }

    /// Forget nodes the host has dropped.
    pub fn prune_detached(&mut self) -> usize {
        let before = self.suppressed.len();
        self.suppressed.retain(|_, entry| entry.node.is_connected());
        before - self.suppressed.len()
    }
}

fn undo(node: &NodeRef, entry: &Suppressed) {
    match (&entry.markup, entry.mode.css_class()) {
        (Some(markup), _) => node.set_markup(markup),
        (None, Some(class)) => remove_class(node, class),
        (None, None) => {}
    }
}

fn add_class(node: &NodeRef, class: &str) {
    let current = node.attr("class").unwrap_or_default();
    if current.split_whitespace().any(|c| c == class) {
        return;
    }
    let updated = if current.trim().is_empty() {
        class.to_string()
    } else {
        format!("{} {class}", current.trim())
    };
    node.set_attr("class", &updated);
}

fn remove_class(node: &NodeRef, class: &str) {
    let Some(current) = node.attr("class") else {
        return;
    };
    let remaining: Vec<&str> = current.split_whitespace().filter(|c| *c != class).collect();
    if remaining.is_empty() {
        node.remove_attr("class");
    } else {
        node.set_attr("class", &remaining.join(" "));
    }
}

fn summary_markup(reasons: &[String]) -> String {
    let reasons = reasons
        .iter()
        .map(|r| escape_html(r))
        .collect::<Vec<_>>()
        .join(" · ");
    format!(
        "<div class=\"slop-summary\">\
         <span class=\"slop-summary-label\">Likely slop</span>\
         <span class=\"slop-summary-reasons\">{reasons}</span>\
         <button type=\"button\" {ACTION_ATTR}=\"restore\">Show anyway</button>\
         </div>"
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
