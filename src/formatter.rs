//! Line formatter capability consumed by the schedulers.
//!
//! A formatter turns an opaque context and opaque items into fragments of
//! the engine's line grammar. The driver never inspects either value; it
//! only composes `common ⊔ item ⊔ '\n'` and streams the result. Formatters
//! are called strictly sequentially within one call, and never again for a
//! call once its write deadline has passed.
//!
//! The trait is a capability set, not a hierarchy: `parse_element` and
//! `formatted_example` have provided defaults, so most implementors only
//! write the two fragment producers.

use crate::errors::FormatError;

/// Free-form notes a formatter may record while building lines.
///
/// Passed through the schedulers untouched; useful for capturing which
/// cached fragments were hit, which features were dropped, and similar
/// call-scoped breadcrumbs.
#[derive(Debug, Default)]
pub struct DebugInfo {
    pub notes: Vec<String>,
}

impl DebugInfo {
    pub fn note(&mut self, msg: impl Into<String>) {
        self.notes.push(msg.into());
    }
}

/// Caller contract for translating (context, item) pairs into engine input
/// lines.
pub trait LineFormatter {
    /// Opaque shared-features value for one call.
    type Context;
    /// Opaque per-candidate value.
    type Item;

    /// Produces the line fragment shared by every item of this call.
    ///
    /// Invoked exactly once per `predict`/`train` call. A failure here
    /// aborts the call: without the prefix no line can be built.
    fn common(
        &self,
        ctx: &Self::Context,
        debug: Option<&mut DebugInfo>,
    ) -> Result<String, FormatError>;

    /// Produces the item-specific line fragment.
    ///
    /// Invoked up to once per item; a failure skips the item (the skip is
    /// counted in the call metrics) and the batch continues.
    fn item(
        &self,
        ctx: &Self::Context,
        item: &Self::Item,
        debug: Option<&mut DebugInfo>,
    ) -> Result<String, FormatError>;

    /// Translates one audit feature element into a human-readable
    /// `(namespace, name)` pair.
    ///
    /// The default splits on the first `^`; elements without a namespace
    /// marker map to an empty namespace.
    fn parse_element(&self, element: &str) -> (String, String) {
        match element.split_once('^') {
            Some((ns, name)) => (ns.to_string(), name.to_string()),
            None => (String::new(), element.to_string()),
        }
    }

    /// Composes one full engine line from its fragments.
    ///
    /// With a label (training) the line is `label [weight] common item`;
    /// without, `common item`. Empty fragments collapse so no double
    /// spaces appear.
    fn formatted_example(
        &self,
        common: &str,
        item: &str,
        label: Option<f64>,
        weight: Option<f64>,
    ) -> String {
        let mut line = String::with_capacity(common.len() + item.len() + 16);
        if let Some(label) = label {
            line.push_str(&label.to_string());
            if let Some(weight) = weight {
                line.push(' ');
                line.push_str(&weight.to_string());
            }
        }
        for part in [common, item] {
            if part.is_empty() {
                continue;
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(part);
        }
        line
    }
}

/// Formatter for callers that already hold pre-formatted line fragments.
///
/// Context and items are passed through verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughFormatter;

impl LineFormatter for PassthroughFormatter {
    type Context = String;
    type Item = String;

    fn common(
        &self,
        ctx: &Self::Context,
        _debug: Option<&mut DebugInfo>,
    ) -> Result<String, FormatError> {
        Ok(ctx.clone())
    }

    fn item(
        &self,
        _ctx: &Self::Context,
        item: &Self::Item,
        _debug: Option<&mut DebugInfo>,
    ) -> Result<String, FormatError> {
        Ok(item.clone())
    }
}
