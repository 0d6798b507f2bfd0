//! SimHash over the structure of an HTML document
//!
//! The document is reduced to a stream of structural features (tags, doctype,
//! comments, text placeholders and a few attribute values), consecutive
//! features are joined into shingles, and the shingle hashes vote on each of
//! the 64 output bits.

use ego_tree::iter::Edge;
use scraper::{Html, Node};

use super::{hash_exact, FINGERPRINT_BITS};

/// Cap on the number of tokens considered per document
pub const DEFAULT_MAX_TOKENS: usize = 5000;

/// Attributes whose values carry structural meaning
const VALUE_ATTRIBUTES: &[&str] = &["class", "name", "rel"];

/// Elements that never have a closing tag
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Compute the similarity fingerprint of an HTML page.
///
/// Parsing never fails: html5ever recovers from malformed markup, so the
/// fingerprint covers whatever structure the parser could build.
pub fn hash_similarity(body: &str, shingle_factor: usize, max_tokens: usize) -> u64 {
    let features = structural_features(body, max_tokens);
    simhash(shingles(&features, shingle_factor.max(1)).iter().map(|s| hash_exact(s)))
}

/// Tokenize a page into structural feature strings.
///
/// Prefixes follow the token kind: `A` start tag, `B` end tag, `C` void
/// (self-closing) tag, `D` doctype, `E` comment, `F` text, `G` attribute.
pub fn structural_features(body: &str, max_tokens: usize) -> Vec<String> {
    let document = Html::parse_document(body);
    let mut features = Vec::new();
    let mut tokens = 0usize;

    for edge in document.tree.root().traverse() {
        if tokens >= max_tokens {
            break;
        }
        match edge {
            Edge::Open(node) => match node.value() {
                Node::Element(element) => {
                    tokens += 1;
                    let name = element.name();
                    let prefix = if VOID_ELEMENTS.contains(&name) { "C" } else { "A" };
                    features.push(format!("{}:{}", prefix, name));
                    // Attribute storage is unordered
                    let mut attrs: Vec<(&str, &str)> = element.attrs().collect();
                    attrs.sort_unstable();
                    for (key, value) in attrs {
                        if VALUE_ATTRIBUTES.contains(&key) {
                            features.push(format!("G:{}:{}:{}", name, key, value));
                        } else {
                            features.push(format!("G:{}:{}", name, key));
                        }
                    }
                }
                Node::Doctype(doctype) => {
                    tokens += 1;
                    features.push(format!("D:{}", doctype.name()));
                }
                Node::Comment(_) => {
                    tokens += 1;
                    features.push("E:".to_string());
                }
                Node::Text(_) => {
                    tokens += 1;
                    features.push("F:".to_string());
                }
                _ => {}
            },
            Edge::Close(node) => {
                if let Node::Element(element) = node.value() {
                    let name = element.name();
                    if !VOID_ELEMENTS.contains(&name) {
                        tokens += 1;
                        features.push(format!("B:{}", name));
                    }
                }
            }
        }
    }

    features
}

/// Join consecutive features into overlapping windows of `k`.
///
/// Fewer than `k` features collapse into a single window.
fn shingles(features: &[String], k: usize) -> Vec<String> {
    if features.is_empty() {
        return Vec::new();
    }
    if features.len() < k {
        return vec![features.join(" ")];
    }
    features.windows(k).map(|w| w.join(" ")).collect()
}

/// Charikar's simhash: bit `i` is set iff more checksums have bit `i` set than clear
fn simhash(checksums: impl Iterator<Item = u64>) -> u64 {
    let mut vector = [0i64; FINGERPRINT_BITS as usize];
    for sum in checksums {
        for (i, slot) in vector.iter_mut().enumerate() {
            if (sum >> i) & 1 == 1 {
                *slot += 1;
            } else {
                *slot -= 1;
            }
        }
    }

    let mut fingerprint = 0u64;
    for (i, v) in vector.iter().enumerate() {
        if *v > 0 {
            fingerprint |= 1 << i;
        }
    }
    fingerprint
}
