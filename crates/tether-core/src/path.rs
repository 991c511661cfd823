//! Access guards for dotted member paths.
//!
//! A segment is refused when it is empty, starts or ends with `_` (the
//! private/shadow convention), or names `constructor` or `prototype`.
//! [`is_exposable`] is a `const fn` so the `driver!` macro can refuse such
//! members at compile time with the same rule the Provider enforces at runtime.

use crate::error::RemoteError;

const RESERVED: [&str; 2] = ["constructor", "prototype"];

const fn bytes_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

/// Whether a single member name may be reached remotely.
pub const fn is_exposable(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    if bytes.is_empty() || bytes[0] == b'_' || bytes[bytes.len() - 1] == b'_' {
        return false;
    }
    let mut i = 0;
    while i < RESERVED.len() {
        if bytes_eq(bytes, RESERVED[i].as_bytes()) {
            return false;
        }
        i += 1;
    }
    true
}

/// Check one segment of `listener`, naming the violated rule on failure.
pub fn check_segment(listener: &str, segment: &str) -> Result<(), RemoteError> {
    if segment.is_empty() {
        Err(RemoteError::type_error(format!(
            "empty member name in Provider.{}()",
            listener
        )))
    } else if segment.starts_with('_') {
        Err(RemoteError::security(format!(
            "access to a member starting with an underscore is not allowed: Provider.{}()",
            listener
        )))
    } else if segment.ends_with('_') {
        Err(RemoteError::security(format!(
            "access to a member ending with an underscore is not allowed: Provider.{}()",
            listener
        )))
    } else if RESERVED.iter().any(|reserved| *reserved == segment) {
        Err(RemoteError::security(format!(
            "access to {} is not allowed: Provider.{}()",
            segment, listener
        )))
    } else {
        Ok(())
    }
}

/// Run the segment guards over a whole dotted path.
pub fn check_listener(listener: &str) -> Result<(), RemoteError> {
    listener
        .split('.')
        .try_for_each(|segment| check_segment(listener, segment))
}

/// Append `member` to a dotted path.
pub fn join(base: &str, member: &str) -> String {
    if base.is_empty() {
        member.to_string()
    } else {
        format!("{}.{}", base, member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposable_names() {
        assert!(is_exposable("plus"));
        assert!(is_exposable("a_b"));
        assert!(!is_exposable("_secret"));
        assert!(!is_exposable("secret_"));
        assert!(!is_exposable("constructor"));
        assert!(!is_exposable("prototype"));
        assert!(!is_exposable(""));
    }

    #[test]
    fn test_exposable_in_const_context() {
        const OK: bool = is_exposable("double");
        const BAD: bool = is_exposable("prototype");
        assert!(OK);
        assert!(!BAD);
    }

    #[test]
    fn test_check_listener_names_rule() {
        let err = check_listener("nested._hidden").unwrap_err();
        assert_eq!(err.name, "SecurityError");
        assert!(err.message.contains("starting with an underscore"));

        let err = check_listener("plus.prototype").unwrap_err();
        assert!(err.message.contains("access to prototype"));

        assert!(check_listener("nested.double").is_ok());
        assert_eq!(check_listener("a..b").unwrap_err().name, "TypeError");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("", "plus"), "plus");
        assert_eq!(join("nested", "double"), "nested.double");
    }
}
