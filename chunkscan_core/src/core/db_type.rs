use std::fmt::Display;

/// Fallback width for variable-length values when no better estimate exists.
pub const DEFAULT_VARLENA_WIDTH: u32 = 32;

#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash)]
pub enum DbType {
    I32,
    I64,
    F64,
    BOOL,
    STRING,
}

impl Display for DbType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{:?}", self))
    }
}

impl DbType {
    /// Fixed encoded size, `None` for variable-length types.
    pub fn get_size(&self) -> Option<u32> {
        match self {
            DbType::I32 => Some(4),
            DbType::I64 => Some(8),
            DbType::F64 => Some(8),
            DbType::BOOL => Some(1),
            DbType::STRING => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DbType::I32 | DbType::I64 | DbType::F64)
    }

    pub fn is_varlena(&self) -> bool {
        self.get_size().is_none()
    }

    /// Average width used by output buffer estimation.
    pub fn default_width(&self) -> u32 {
        match self.get_size() {
            Some(size) => size,
            // length prefix + payload
            None => 4 + DEFAULT_VARLENA_WIDTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(DbType::I32.get_size(), Some(4));
        assert_eq!(DbType::F64.get_size(), Some(8));
        assert_eq!(DbType::STRING.get_size(), None);
        assert!(DbType::STRING.is_varlena());
        assert!(!DbType::BOOL.is_numeric());
        assert_eq!(DbType::STRING.default_width(), 4 + DEFAULT_VARLENA_WIDTH);
    }

    #[test]
    fn test_display() {
        assert_eq!(DbType::I64.to_string(), "I64");
    }
}
