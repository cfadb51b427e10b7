use smallvec::SmallVec;

use super::db_type::DbType;

pub type AttrNumber = u16;

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub db_type: DbType,
    /// Estimated average encoded width of the attribute, in bytes.
    pub avg_width: u32,
}

impl Attribute {
    pub fn new(name: &str, db_type: DbType) -> Self {
        Attribute {
            name: name.to_string(),
            db_type,
            avg_width: db_type.default_width(),
        }
    }

    pub fn with_width(mut self, avg_width: u32) -> Self {
        self.avg_width = avg_width;
        self
    }
}

/// Tuple descriptor: ordered list of attributes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TupleDesc {
    attrs: Vec<Attribute>,
}

impl TupleDesc {
    pub fn new(attrs: Vec<Attribute>) -> Self {
        TupleDesc { attrs }
    }

    #[inline]
    pub fn natts(&self) -> usize {
        self.attrs.len()
    }

    #[inline]
    pub fn attr(&self, attno: usize) -> Option<&Attribute> {
        self.attrs.get(attno)
    }

    pub fn attrs(&self) -> &[Attribute] {
        &self.attrs
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.attrs.iter().position(|a| a.name == name)
    }

    /// Bytes taken by the tuple header: attribute count plus null bitmap.
    #[inline]
    pub fn header_size(&self) -> usize {
        2 + bitmap_len(self.natts())
    }

    /// Header plus the sum of the average attribute widths.
    pub fn estimated_width(&self) -> u32 {
        self.header_size() as u32 + self.attrs.iter().map(|a| a.avg_width).sum::<u32>()
    }
}

#[inline]
pub fn bitmap_len(natts: usize) -> usize {
    natts.div_ceil(8)
}

/// Sorted, duplicate-free set of attribute numbers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct AttrSet(SmallVec<[AttrNumber; 16]>);

impl AttrSet {
    pub fn new() -> Self {
        AttrSet(SmallVec::new())
    }

    pub fn all(natts: usize) -> Self {
        (0..natts as AttrNumber).collect()
    }

    pub fn insert(&mut self, attno: AttrNumber) {
        if let Err(pos) = self.0.binary_search(&attno) {
            self.0.insert(pos, attno);
        }
    }

    pub fn contains(&self, attno: AttrNumber) -> bool {
        self.0.binary_search(&attno).is_ok()
    }

    pub fn is_subset_of(&self, other: &AttrSet) -> bool {
        self.0.iter().all(|a| other.contains(*a))
    }

    pub fn iter(&self) -> impl Iterator<Item = AttrNumber> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<AttrNumber> for AttrSet {
    fn from_iter<T: IntoIterator<Item = AttrNumber>>(iter: T) -> Self {
        let mut set = AttrSet::new();
        for attno in iter {
            set.insert(attno);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_set_sorted_unique() {
        let set: AttrSet = [3, 1, 3, 0].into_iter().collect();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 3]);
        assert!(set.contains(1));
        assert!(!set.contains(2));
        assert!(AttrSet::from_iter([0, 3]).is_subset_of(&set));
        assert!(!AttrSet::all(3).is_subset_of(&set));
    }

    #[test]
    fn test_desc_header() {
        let desc = TupleDesc::new(vec![
            Attribute::new("id", DbType::I32),
            Attribute::new("name", DbType::STRING).with_width(12),
        ]);
        assert_eq!(desc.header_size(), 3);
        assert_eq!(desc.estimated_width(), 3 + 4 + 12);
        assert_eq!(desc.index_of("name"), Some(1));
        assert_eq!(desc.index_of("missing"), None);
    }
}
