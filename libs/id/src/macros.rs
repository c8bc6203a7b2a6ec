//! Macros for defining typed ID types.

/// Maximum length of any ID, matching the Kubernetes label value limit so IDs
/// can be stamped onto pods.
pub const MAX_ID_LEN: usize = 63;

/// Returns true if `c` may appear in an ID.
///
/// `.` is excluded: queue names are `<kind>.<projectID>`, and Service Bus
/// splits them on the one dot.
#[inline]
pub(crate) fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_')
}

/// Macro to define a typed, string-backed ID.
///
/// This generates a newtype wrapper around `String` with:
/// - A `KIND` constant used in error messages
/// - `parse()` to validate from a string
/// - `as_str()` for borrowing
/// - `Display`, `FromStr`, `AsRef<str>` implementations
/// - `Serialize` and `Deserialize` implementations (validated on the way in)
///
/// # Example
///
/// ```ignore
/// define_id!(ProjectId, "project ID");
///
/// let id: ProjectId = "italian".parse()?;
/// assert_eq!(id.as_str(), "italian");
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $kind:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Human-readable name of this ID type.
            pub const KIND: &'static str = $kind;

            /// Parses and validates an ID from a string.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::validate(Self::KIND, s)?;
                Ok(Self(s.to_string()))
            }

            /// Borrows the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the ID, returning the inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
