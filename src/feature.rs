//! Lazily materialized feature views.
//!
//! A [`Feature`] is a thin handle over a raw record inside a tile page. It
//! keeps its own reference to the page, so it stays valid after the query
//! that produced it has been dropped. All accessors decode on demand.

use crate::error::{Result, StoreError};
use crate::format;
use crate::storage::TilePage;
use crate::types::BoundingBox;

/// The physical kind of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    Node,
    Way,
    Relation,
}

/// A matched feature, backed by its tile page.
///
/// Constructed only by the query engine, which has already validated that
/// the record header lies within the page.
#[derive(Debug, Clone)]
pub struct Feature {
    page: TilePage,
    ofs: u32,
}

impl Feature {
    pub(crate) fn new(page: TilePage, ofs: u32) -> Self {
        debug_assert!(ofs as usize + 12 <= page.len());
        Self { page, ofs }
    }

    #[inline]
    fn buf(&self) -> &[u8] {
        self.page.bytes()
    }

    #[inline]
    fn idflags(&self) -> u64 {
        let ofs = self.ofs as usize;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf()[ofs..ofs + 8]);
        u64::from_le_bytes(raw)
    }

    #[inline]
    fn flags(&self) -> u8 {
        self.buf()[self.ofs as usize]
    }

    /// The feature's id within its kind.
    pub fn id(&self) -> u64 {
        self.idflags() >> 8
    }

    pub fn kind(&self) -> FeatureKind {
        match self.flags() & format::KIND_MASK {
            format::KIND_NODE => FeatureKind::Node,
            format::KIND_RELATION => FeatureKind::Relation,
            _ => FeatureKind::Way,
        }
    }

    /// Whether the feature represents an area (closed way or multipolygon
    /// relation).
    pub fn is_area(&self) -> bool {
        self.flags() & format::FLAG_AREA != 0
    }

    /// Whether the feature belongs to at least one relation.
    pub fn is_relation_member(&self) -> bool {
        self.flags() & format::FLAG_RELATION_MEMBER != 0
    }

    /// For nodes: whether the node also appears as a way vertex.
    pub fn is_way_node(&self) -> bool {
        self.flags() & format::FLAG_WAY_NODE != 0
    }

    /// Identity key shared by all physical copies of this feature.
    pub(crate) fn identity_key(&self) -> u64 {
        format::identity_key(self.idflags())
    }

    /// The feature's bounding box. For nodes this is the single-point box
    /// of their coordinate.
    pub fn bounds(&self) -> Result<BoundingBox> {
        let buf = self.buf();
        let ofs = self.ofs as usize;
        // The geometry prefix sits in front of the record; a record offset
        // too close to the start of the tile is a layout violation.
        let prefix = if self.kind() == FeatureKind::Node { 8 } else { 16 };
        let base = ofs.checked_sub(prefix).ok_or_else(|| {
            StoreError::Corrupt(format!("record offset {ofs} has no geometry prefix"))
        })?;
        if self.kind() == FeatureKind::Node {
            let x = format::read_i32(buf, base)?;
            let y = format::read_i32(buf, base + 4)?;
            Ok(BoundingBox::point(x, y))
        } else {
            Ok(BoundingBox::new(
                format::read_i32(buf, base)?,
                format::read_i32(buf, base + 4)?,
                format::read_i32(buf, base + 8)?,
                format::read_i32(buf, base + 12)?,
            ))
        }
    }

    /// Iterates the feature's tags.
    pub fn tags(&self) -> Result<format::RawTags<'_>> {
        let tags_ofs = format::read_u32(self.buf(), self.ofs as usize + 8)?;
        format::RawTags::new(self.buf(), tags_ofs)
    }

    /// Looks up a single tag value.
    pub fn tag(&self, key: &str) -> Result<Option<&str>> {
        format::tag_value(self.buf(), self.ofs as usize, key)
    }

    /// Iterates a relation's members. Empty for other kinds and for
    /// relations without a member table.
    pub fn members(&self) -> Result<Members<'_>> {
        if self.kind() != FeatureKind::Relation {
            return Ok(Members::empty(self));
        }
        let body = format::read_u32(self.buf(), self.ofs as usize + 12)?;
        if body == 0 {
            return Ok(Members::empty(self));
        }
        let count = format::read_u16(self.buf(), body as usize)? as usize;
        Ok(Members {
            feature: self,
            pos: body as usize + 4,
            remaining: count,
        })
    }
}

/// One member of a relation: the member feature and its role.
pub struct Member<'a> {
    pub feature: Feature,
    pub role: &'a str,
}

/// Iterator over a relation's member table.
pub struct Members<'a> {
    feature: &'a Feature,
    pos: usize,
    remaining: usize,
}

impl<'a> Members<'a> {
    fn empty(feature: &'a Feature) -> Self {
        Self {
            feature,
            pos: 0,
            remaining: 0,
        }
    }
}

impl<'a> Iterator for Members<'a> {
    type Item = Result<Member<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            self.remaining -= 1;
            let buf = self.feature.buf();
            let entry = (|| {
                let rec_ofs = format::read_u32(buf, self.pos)?;
                let role_ofs = format::read_u32(buf, self.pos + 4)?;
                self.pos += 8;
                Ok::<_, StoreError>((rec_ofs, role_ofs))
            })();
            match entry {
                // A zero record offset marks a member stored in another
                // tile; it is skipped rather than surfaced.
                Ok((0, _)) => continue,
                Ok((rec_ofs, role_ofs)) => {
                    let role = match format::read_str(buf, role_ofs as usize) {
                        Ok(role) => role,
                        Err(e) => {
                            self.remaining = 0;
                            return Some(Err(e));
                        }
                    };
                    if rec_ofs as usize + 12 > buf.len() {
                        self.remaining = 0;
                        return Some(Err(StoreError::Corrupt(format!(
                            "member record offset {rec_ofs} out of range"
                        ))));
                    }
                    return Some(Ok(Member {
                        feature: Feature::new(self.feature.page.clone(), rec_ofs),
                        role,
                    }));
                }
                Err(e) => {
                    self.remaining = 0;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Secondary predicate applied to materialized features.
///
/// Unlike a [`crate::Matcher`], a filter sees the typed view rather than
/// the raw record, so it can use decoded geometry or tag strings.
pub trait FeatureFilter: Send + Sync {
    fn test(&self, feature: &Feature) -> Result<bool>;
}

impl<F> FeatureFilter for F
where
    F: Fn(&Feature) -> Result<bool> + Send + Sync,
{
    fn test(&self, feature: &Feature) -> Result<bool> {
        self(feature)
    }
}
