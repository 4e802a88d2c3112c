use lazy_static::lazy_static;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// This module contains the identity types under which views are addressed.
// They use the newtype pattern for strong type safety.

// TOKEN_CHAR is a string production which allows Unicode letters and numbers,
// and the restricted punctuation that appears in database, table, and
// partition-value path segments (`ds=2024-05-30` and the like).
const TOKEN_CHAR: &'static str = r"\p{Letter}\p{Number}\-_\.=";

lazy_static! {
    // TOKEN is one or more TOKEN_CHARs.
    static ref TOKEN: String = ["[", TOKEN_CHAR, "]+"].concat();
    // VIEW_PATH_RE is two or more TOKEN components joined by '/':
    // a database, a table, and any number of partition values.
    // It may not begin or end in a '/'.
    static ref VIEW_PATH_RE: Regex =
        Regex::new(&["^", &TOKEN, "/", &TOKEN, "(/", &TOKEN, ")*$"].concat()).unwrap();
    // TABLE_NAME_RE is exactly two TOKEN components joined by '/'.
    static ref TABLE_NAME_RE: Regex =
        Regex::new(&["^", &TOKEN, "/", &TOKEN, "$"].concat()).unwrap();
}

macro_rules! string_path_types {
    (
        $(#[$outer:meta])*
        $vis:vis struct $Wrapper:ident(pattern = $Regex:ident, example = $Example:literal);

        $($rest:tt)*
    ) => {

        $(#[$outer])*
        #[derive(
            Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash,
            JsonSchema,
        )]
        pub struct $Wrapper(String);

        impl $Wrapper {
            /// Build an instance without validating it.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            /// Validate `s` and build an instance from it.
            pub fn parse(s: impl Into<String>) -> anyhow::Result<Self> {
                let s = s.into();
                if !$Regex.is_match(&s) {
                    anyhow::bail!(
                        "{} `{s}` doesn't match pattern {}",
                        stringify!($Wrapper),
                        $Regex.as_str(),
                    );
                }
                Ok(Self(s))
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
            pub fn example() -> Self {
                Self($Example.into())
            }
        }

        impl std::ops::Deref for $Wrapper {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $Wrapper {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<$Wrapper> for String {
            fn from(w: $Wrapper) -> String {
                w.0
            }
        }

        impl fmt::Display for $Wrapper {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_ref())
            }
        }

        string_path_types! { $($rest)* }
    };
    () => {};
}

string_path_types! {
    /// ViewPath is the stable identity of a view: its database and table
    /// segments followed by any partition-value segments.
    pub struct ViewPath(pattern = VIEW_PATH_RE, example = "shop/Orders/ds=2024-05-30");

    /// TableName is the `database/Table` prefix under which a table's
    /// partition views group.
    pub struct TableName(pattern = TABLE_NAME_RE, example = "shop/Orders");
}

impl ViewPath {
    /// The `database/Table` prefix under which this view groups.
    pub fn table_name(&self) -> TableName {
        let mut segments = self.segments();
        match (segments.next(), segments.next()) {
            (Some(db), Some(table)) => TableName::new([db, "/", table].concat()),
            _ => TableName::new(self.0.clone()),
        }
    }

    /// Path segments, in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}
