//! Systematic-variation expansion.
//!
//! Every uncertainty source produces an Up and a Down variant. Shape sources
//! change the event selection itself: the variant tag carries the suffix and
//! the weight list is untouched, so downstream code re-derives kinematics
//! from the varied columns. Rate sources only change the weight product: the
//! tag stays neutral and the named weight is replaced by its suffixed
//! counterparts.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Variant tag of the unmodified selection.
pub const NEUTRAL: &str = "NA";

/// Which uncertainty sources affect the selection rather than the weights.
///
/// This classification is configuration, not something inferred from the
/// source name. The default matches the jet-energy sources every analysis
/// carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeSystematics(BTreeSet<String>);

impl Default for ShapeSystematics {
    fn default() -> Self {
        Self(["JES".to_string(), "JER".to_string()].into())
    }
}

impl ShapeSystematics {
    /// Build from an explicit list of source names.
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(names: I) -> Self {
        Self(names.into_iter().map(Into::into).collect())
    }

    /// Whether the source varies the selection.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }
}

/// One `(selection-variant tag, effective weight list)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    /// Selection-variant tag; [`NEUTRAL`] for the unmodified selection.
    pub tag: String,
    /// Weight names to apply under this variant.
    pub weights: Vec<String>,
}

impl Variant {
    /// Suffix appended to cutflow and histogram keys.
    pub fn suffix(&self) -> String {
        tag_suffix(&self.tag)
    }

    /// Whether this is the unmodified hypothesis.
    pub fn is_neutral(&self) -> bool {
        self.tag == NEUTRAL
    }
}

/// Key suffix for a variant tag: empty for neutral, `_<tag>` otherwise.
pub fn tag_suffix(tag: &str) -> String {
    if tag == NEUTRAL {
        String::new()
    } else {
        format!("_{}", tag)
    }
}

/// Expand uncertainty sources into the full variant list.
///
/// The neutral variant always comes first. The literal `"NA"` among the
/// sources is ignored. Sources are processed in sorted order so the output
/// is reproducible.
pub fn expand_systematics(
    systematics: &[String],
    weights: &[String],
    shape: &ShapeSystematics,
) -> Vec<Variant> {
    let mut variants =
        vec![Variant { tag: NEUTRAL.to_string(), weights: weights.to_vec() }];

    let sources: BTreeSet<&str> =
        systematics.iter().map(String::as_str).filter(|s| *s != NEUTRAL).collect();

    for source in sources {
        if shape.contains(source) {
            for direction in ["Up", "Down"] {
                variants.push(Variant {
                    tag: format!("{}{}", source, direction),
                    weights: weights.to_vec(),
                });
            }
        } else {
            let base: Vec<String> =
                weights.iter().filter(|w| w.as_str() != source).cloned().collect();
            for direction in ["Up", "Down"] {
                let mut varied = base.clone();
                varied.push(format!("{}{}", source, direction));
                variants.push(Variant { tag: NEUTRAL.to_string(), weights: varied });
            }
        }
    }
    variants
}
