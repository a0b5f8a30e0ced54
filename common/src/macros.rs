/// Declares a uuid-backed identifier type.
///
/// Ids are either random (`unique`), fixed at compile time (`from_u128`, for
/// registries of well-known entries), or the nil sentinel that marks "not
/// bound" in descriptions. They are plain `Copy` keys: hashable, comparable
/// and serializable, with no public access to the wrapped uuid.
#[macro_export]
macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Clone, Copy, PartialEq, Eq, Hash, Debug, serde::Serialize, serde::Deserialize,
        )]
        #[repr(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            pub fn unique() -> $name {
                $name(uuid::Uuid::new_v4())
            }

            pub const fn from_u128(value: u128) -> $name {
                $name(uuid::Uuid::from_u128(value))
            }

            pub fn nil() -> $name {
                $name::from_u128(0)
            }

            pub fn is_nil(&self) -> bool {
                *self == $name::nil()
            }
        }

        impl Default for $name {
            fn default() -> $name {
                $name::nil()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}
