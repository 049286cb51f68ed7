//! Readiness interest returned by the connection callbacks.

/// Which readiness notifications a connection wants next.
///
/// `None` means the connection is finished and must be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    None,
    ReadOnly,
    WriteOnly,
    Both,
}

impl Interest {
    /// Build an interest set from its read and write halves.
    pub const fn new(read: bool, write: bool) -> Self {
        match (read, write) {
            (false, false) => Interest::None,
            (true, false) => Interest::ReadOnly,
            (false, true) => Interest::WriteOnly,
            (true, true) => Interest::Both,
        }
    }

    pub const fn is_readable(self) -> bool {
        matches!(self, Interest::ReadOnly | Interest::Both)
    }

    pub const fn is_writable(self) -> bool {
        matches!(self, Interest::WriteOnly | Interest::Both)
    }

    /// Whether the connection should be closed.
    pub const fn is_none(self) -> bool {
        matches!(self, Interest::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_halves() {
        for read in [false, true] {
            for write in [false, true] {
                let interest = Interest::new(read, write);
                assert_eq!(interest.is_readable(), read);
                assert_eq!(interest.is_writable(), write);
                assert_eq!(interest.is_none(), !read && !write);
            }
        }
    }
}
