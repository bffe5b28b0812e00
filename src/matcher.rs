//! Predicate capabilities tested against raw feature records.
//!
//! A [`Matcher`] is consulted at three granularities while a tile is
//! scanned: per index bucket ([`Matcher::accept_index`], pure pruning),
//! per feature with a combined kind check ([`Matcher::accept_typed`]), and
//! per feature against the full record ([`Matcher::accept`]).
//!
//! The stock implementation is an interpreted predicate tree ([`TagExpr`])
//! evaluated directly against the record's tag table. Compiled matcher
//! sets are cached by exact query string in a [`MatcherCache`]; the textual
//! query syntax itself is supplied by the embedder as a compile callback.

use crate::error::{Result, StoreError};
use crate::format;
use crate::types::Kinds;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;

/// A compiled predicate tested against one raw feature record.
pub trait Matcher: Send + Sync {
    /// Full predicate test against the record at `rec_ofs`.
    fn accept(&self, buf: &[u8], rec_ofs: usize) -> Result<bool>;

    /// Combined kind check and full predicate test.
    fn accept_typed(&self, kinds: Kinds, buf: &[u8], rec_ofs: usize) -> Result<bool> {
        let flags = *buf
            .get(rec_ofs)
            .ok_or_else(|| StoreError::Corrupt(format!("record offset {rec_ofs} out of range")))?;
        if !kinds.accepts_flags(flags) {
            return Ok(false);
        }
        self.accept(buf, rec_ofs)
    }

    /// Whether a feature satisfying this predicate could live in an index
    /// bucket carrying `category_bits`. Must be conservative: never reject
    /// a bucket that could contain a true match.
    fn accept_index(&self, _category_bits: u32) -> bool {
        true
    }

    /// Role-specific sub-matcher for relation members carrying `role`, or
    /// `None` when no per-role override applies; the member is then tested
    /// with the matcher's own [`Matcher::accept`].
    fn accept_role(&self, _role: &str) -> Option<&dyn Matcher> {
        None
    }
}

/// Matcher accepting every feature.
#[derive(Debug, Default)]
pub struct AllMatcher;

impl Matcher for AllMatcher {
    fn accept(&self, _buf: &[u8], _rec_ofs: usize) -> Result<bool> {
        Ok(true)
    }
}

/// Registry assigning tag keys to index categories.
///
/// Stores partition some kinds into tag-category buckets; a bucket's
/// category bits are the union of the categories of the keys its features
/// carry. Keys without an assigned category cannot be used for pruning.
#[derive(Debug, Clone, Default)]
pub struct Categories {
    bits: FxHashMap<String, u32>,
}

impl Categories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `key` to category `bit` (0-31).
    pub fn assign(&mut self, key: impl Into<String>, bit: u8) {
        debug_assert!(bit < 32);
        self.bits.insert(key.into(), 1 << bit);
    }

    /// Category mask of `key`; 0 if the key is uncategorized.
    pub fn mask_of(&self, key: &str) -> u32 {
        self.bits.get(key).copied().unwrap_or(0)
    }
}

/// Interpreted predicate tree over a feature's tag table.
///
/// Numeric comparisons parse the tag value as a float and fail closed
/// (a non-numeric value never matches). [`TagExpr::Ne`] follows absence
/// semantics: a feature without the key also matches.
#[derive(Debug, Clone)]
pub enum TagExpr {
    /// Matches everything.
    Any,
    /// The key is present with any value.
    Has(String),
    Eq(String, String),
    Ne(String, String),
    Lt(String, f64),
    Le(String, f64),
    Gt(String, f64),
    Ge(String, f64),
    /// The key's value is one of the listed values.
    OneOf(String, SmallVec<[String; 4]>),
    And(Vec<TagExpr>),
    Or(Vec<TagExpr>),
    Not(Box<TagExpr>),
}

impl TagExpr {
    pub fn has(key: impl Into<String>) -> Self {
        TagExpr::Has(key.into())
    }

    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        TagExpr::Eq(key.into(), value.into())
    }

    pub fn ne(key: impl Into<String>, value: impl Into<String>) -> Self {
        TagExpr::Ne(key.into(), value.into())
    }

    pub fn one_of<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TagExpr::OneOf(key.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn and(exprs: impl IntoIterator<Item = TagExpr>) -> Self {
        TagExpr::And(exprs.into_iter().collect())
    }

    pub fn or(exprs: impl IntoIterator<Item = TagExpr>) -> Self {
        TagExpr::Or(exprs.into_iter().collect())
    }

    pub fn not(expr: TagExpr) -> Self {
        TagExpr::Not(Box::new(expr))
    }

    /// Evaluates the tree against the record at `rec_ofs`.
    pub fn eval(&self, buf: &[u8], rec_ofs: usize) -> Result<bool> {
        match self {
            TagExpr::Any => Ok(true),
            TagExpr::Has(key) => Ok(format::tag_value(buf, rec_ofs, key)?.is_some()),
            TagExpr::Eq(key, value) => {
                Ok(format::tag_value(buf, rec_ofs, key)? == Some(value.as_str()))
            }
            TagExpr::Ne(key, value) => {
                Ok(format::tag_value(buf, rec_ofs, key)? != Some(value.as_str()))
            }
            TagExpr::Lt(key, limit) => Self::numeric(buf, rec_ofs, key, |v| v < *limit),
            TagExpr::Le(key, limit) => Self::numeric(buf, rec_ofs, key, |v| v <= *limit),
            TagExpr::Gt(key, limit) => Self::numeric(buf, rec_ofs, key, |v| v > *limit),
            TagExpr::Ge(key, limit) => Self::numeric(buf, rec_ofs, key, |v| v >= *limit),
            TagExpr::OneOf(key, values) => {
                let Some(actual) = format::tag_value(buf, rec_ofs, key)? else {
                    return Ok(false);
                };
                Ok(values.iter().any(|v| v == actual))
            }
            TagExpr::And(exprs) => {
                for expr in exprs {
                    if !expr.eval(buf, rec_ofs)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            TagExpr::Or(exprs) => {
                for expr in exprs {
                    if expr.eval(buf, rec_ofs)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            TagExpr::Not(expr) => Ok(!expr.eval(buf, rec_ofs)?),
        }
    }

    fn numeric(buf: &[u8], rec_ofs: usize, key: &str, test: impl Fn(f64) -> bool) -> Result<bool> {
        match format::tag_value(buf, rec_ofs, key)? {
            Some(value) => Ok(value.parse::<f64>().map(&test).unwrap_or(false)),
            None => Ok(false),
        }
    }

    /// Conservative bucket test: could a feature matching this tree live in
    /// a bucket with the given category bits?
    fn could_match_bucket(&self, bits: u32, categories: &Categories) -> bool {
        match self {
            TagExpr::Has(key)
            | TagExpr::Eq(key, _)
            | TagExpr::Lt(key, _)
            | TagExpr::Le(key, _)
            | TagExpr::Gt(key, _)
            | TagExpr::Ge(key, _)
            | TagExpr::OneOf(key, _) => {
                let mask = categories.mask_of(key);
                mask == 0 || bits & mask != 0
            }
            TagExpr::And(exprs) => exprs.iter().all(|e| e.could_match_bucket(bits, categories)),
            TagExpr::Or(exprs) => {
                exprs.is_empty() || exprs.iter().any(|e| e.could_match_bucket(bits, categories))
            }
            // Negations can match features that lack the key entirely.
            TagExpr::Any | TagExpr::Ne(_, _) | TagExpr::Not(_) => true,
        }
    }
}

/// Matcher backed by an interpreted [`TagExpr`] tree.
pub struct ExprMatcher {
    expr: TagExpr,
    categories: Arc<Categories>,
}

impl ExprMatcher {
    pub fn new(expr: TagExpr) -> Self {
        Self {
            expr,
            categories: Arc::new(Categories::default()),
        }
    }

    pub fn with_categories(expr: TagExpr, categories: Arc<Categories>) -> Self {
        Self { expr, categories }
    }
}

impl Matcher for ExprMatcher {
    fn accept(&self, buf: &[u8], rec_ofs: usize) -> Result<bool> {
        self.expr.eval(buf, rec_ofs)
    }

    fn accept_index(&self, category_bits: u32) -> bool {
        self.expr.could_match_bucket(category_bits, &self.categories)
    }
}

/// Conjunction of two matchers.
pub struct AndMatcher {
    a: Arc<dyn Matcher>,
    b: Arc<dyn Matcher>,
}

impl AndMatcher {
    pub fn new(a: Arc<dyn Matcher>, b: Arc<dyn Matcher>) -> Self {
        Self { a, b }
    }
}

impl Matcher for AndMatcher {
    fn accept(&self, buf: &[u8], rec_ofs: usize) -> Result<bool> {
        Ok(self.a.accept(buf, rec_ofs)? && self.b.accept(buf, rec_ofs)?)
    }

    fn accept_index(&self, category_bits: u32) -> bool {
        self.a.accept_index(category_bits) && self.b.accept_index(category_bits)
    }
}

/// Member matcher with per-role overrides over a default inner matcher.
///
/// Members whose role has a registered sub-matcher are tested with it;
/// everything else falls back to the inner matcher.
pub struct RoleMatcher {
    inner: Arc<dyn Matcher>,
    roles: Vec<(String, Arc<dyn Matcher>)>,
}

impl RoleMatcher {
    pub fn new(inner: Arc<dyn Matcher>) -> Self {
        Self {
            inner,
            roles: Vec::new(),
        }
    }

    /// Registers the sub-matcher applied to members carrying `role`.
    pub fn with_role(mut self, role: impl Into<String>, matcher: Arc<dyn Matcher>) -> Self {
        self.roles.push((role.into(), matcher));
        self
    }
}

impl Matcher for RoleMatcher {
    fn accept(&self, buf: &[u8], rec_ofs: usize) -> Result<bool> {
        self.inner.accept(buf, rec_ofs)
    }

    fn accept_index(&self, category_bits: u32) -> bool {
        self.inner.accept_index(category_bits)
    }

    fn accept_role(&self, role: &str) -> Option<&dyn Matcher> {
        self.roles
            .iter()
            .find(|(r, _)| r == role)
            .map(|(_, m)| m.as_ref())
    }
}

/// Constrains relations to those with at least one in-tile member accepted
/// by the member matcher.
///
/// Role dispatch goes through [`Matcher::accept_role`]: a role-specific
/// sub-matcher takes precedence, otherwise the member matcher itself tests
/// the member record. Members stored in another tile cannot be tested
/// locally and are skipped.
pub struct MemberMatcher {
    relation: Arc<dyn Matcher>,
    member: Arc<dyn Matcher>,
}

impl MemberMatcher {
    pub fn new(relation: Arc<dyn Matcher>, member: Arc<dyn Matcher>) -> Self {
        Self { relation, member }
    }
}

impl Matcher for MemberMatcher {
    fn accept(&self, buf: &[u8], rec_ofs: usize) -> Result<bool> {
        if !self.relation.accept(buf, rec_ofs)? {
            return Ok(false);
        }
        let flags = *buf
            .get(rec_ofs)
            .ok_or_else(|| StoreError::Corrupt(format!("record offset {rec_ofs} out of range")))?;
        if flags & format::KIND_MASK != format::KIND_RELATION {
            return Ok(false);
        }
        let body = format::read_u32(buf, rec_ofs + 12)?;
        if body == 0 {
            return Ok(false);
        }
        let count = format::read_u16(buf, body as usize)? as usize;
        let mut pos = body as usize + 4;
        for _ in 0..count {
            let member_ofs = format::read_u32(buf, pos)?;
            let role_ofs = format::read_u32(buf, pos + 4)?;
            pos += 8;
            if member_ofs == 0 {
                continue;
            }
            let role = format::read_str(buf, role_ofs as usize)?;
            let tester = self
                .member
                .accept_role(role)
                .unwrap_or(self.member.as_ref());
            if tester.accept(buf, member_ofs as usize)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn accept_index(&self, category_bits: u32) -> bool {
        self.relation.accept_index(category_bits)
    }
}

/// Matchers grouped by feature kind, plus the derived kind mask.
///
/// One matcher slot per kind tree (nodes, ways, areas, relations) and one
/// for relation members. A kind absent from the mask is never scanned.
#[derive(Clone, Default)]
pub struct MatcherSet {
    nodes: Option<Arc<dyn Matcher>>,
    ways: Option<Arc<dyn Matcher>>,
    areas: Option<Arc<dyn Matcher>>,
    relations: Option<Arc<dyn Matcher>>,
    members: Option<Arc<dyn Matcher>>,
}

impl MatcherSet {
    /// Accepts every feature of the requested kinds.
    pub fn any(kinds: Kinds) -> Self {
        Self::with_matcher(kinds, Arc::new(AllMatcher))
    }

    /// Applies the same matcher to every requested kind.
    pub fn with_matcher(kinds: Kinds, matcher: Arc<dyn Matcher>) -> Self {
        let mut set = Self::default();
        if kinds.contains(Kinds::NODES) {
            set.nodes = Some(matcher.clone());
        }
        if kinds.contains(Kinds::WAYS) {
            set.ways = Some(matcher.clone());
        }
        if kinds.contains(Kinds::AREAS) {
            set.areas = Some(matcher.clone());
        }
        if kinds.contains(Kinds::RELATIONS) {
            set.relations = Some(matcher.clone());
        }
        set
    }

    /// Sets the matcher for a single kind.
    pub fn set(mut self, kind: Kinds, matcher: Arc<dyn Matcher>) -> Self {
        match kind {
            Kinds::NODES => self.nodes = Some(matcher),
            Kinds::WAYS => self.ways = Some(matcher),
            Kinds::AREAS => self.areas = Some(matcher),
            Kinds::RELATIONS => self.relations = Some(matcher),
            _ => panic!("set() expects a single kind"),
        }
        self
    }

    /// Sets the matcher applied to relation members. A relation then only
    /// matches if at least one of its in-tile members passes.
    pub fn with_members(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.members = Some(matcher);
        self
    }

    /// Kind mask derived from the populated slots.
    pub fn kinds(&self) -> Kinds {
        let mut kinds = Kinds::NONE;
        if self.nodes.is_some() {
            kinds = kinds | Kinds::NODES;
        }
        if self.ways.is_some() {
            kinds = kinds | Kinds::WAYS;
        }
        if self.areas.is_some() {
            kinds = kinds | Kinds::AREAS;
        }
        if self.relations.is_some() {
            kinds = kinds | Kinds::RELATIONS;
        }
        kinds
    }

    /// Matcher for a single kind, if that kind is requested.
    pub fn matcher_for(&self, kind: Kinds) -> Option<&Arc<dyn Matcher>> {
        match kind {
            Kinds::NODES => self.nodes.as_ref(),
            Kinds::WAYS => self.ways.as_ref(),
            Kinds::AREAS => self.areas.as_ref(),
            Kinds::RELATIONS => self.relations.as_ref(),
            _ => None,
        }
    }

    /// Matcher for relation members, if any.
    pub fn members(&self) -> Option<&Arc<dyn Matcher>> {
        self.members.as_ref()
    }

    /// Restricts the set to `kinds`, dropping matchers outside the mask.
    pub fn restrict(&self, kinds: Kinds) -> MatcherSet {
        let keep = |slot: &Option<Arc<dyn Matcher>>, kind: Kinds| {
            if kinds.contains(kind) { slot.clone() } else { None }
        };
        MatcherSet {
            nodes: keep(&self.nodes, Kinds::NODES),
            ways: keep(&self.ways, Kinds::WAYS),
            areas: keep(&self.areas, Kinds::AREAS),
            relations: keep(&self.relations, Kinds::RELATIONS),
            members: self.members.clone(),
        }
    }

    /// Conjunction: intersects kind masks and conjoins matchers per kind.
    /// A kind present in only one operand is dropped entirely.
    pub fn and(&self, other: &MatcherSet) -> MatcherSet {
        let conjoin = |a: &Option<Arc<dyn Matcher>>, b: &Option<Arc<dyn Matcher>>| match (a, b) {
            (Some(a), Some(b)) => {
                Some(Arc::new(AndMatcher::new(a.clone(), b.clone())) as Arc<dyn Matcher>)
            }
            _ => None,
        };
        MatcherSet {
            nodes: conjoin(&self.nodes, &other.nodes),
            ways: conjoin(&self.ways, &other.ways),
            areas: conjoin(&self.areas, &other.areas),
            relations: conjoin(&self.relations, &other.relations),
            members: match (&self.members, &other.members) {
                (Some(a), Some(b)) => {
                    Some(Arc::new(AndMatcher::new(a.clone(), b.clone())) as Arc<dyn Matcher>)
                }
                (Some(a), None) => Some(a.clone()),
                (None, Some(b)) => Some(b.clone()),
                (None, None) => None,
            },
        }
    }
}

/// Cache of compiled matcher sets, keyed by exact query string.
///
/// The compile callback is supplied by the embedder; the engine only
/// guarantees that each distinct query string is compiled once.
pub struct MatcherCache {
    compile: Box<dyn Fn(&str) -> Result<MatcherSet> + Send + Sync>,
    cache: Mutex<FxHashMap<String, MatcherSet>>,
}

impl MatcherCache {
    pub fn new(compile: impl Fn(&str) -> Result<MatcherSet> + Send + Sync + 'static) -> Self {
        Self {
            compile: Box::new(compile),
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the compiled set for `query`, compiling on first use.
    pub fn get(&self, query: &str) -> Result<MatcherSet> {
        if let Some(set) = self.cache.lock().get(query) {
            return Ok(set.clone());
        }
        let set = (self.compile)(query)?;
        self.cache
            .lock()
            .entry(query.to_string())
            .or_insert(set.clone());
        Ok(set)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
