//! Proxies for calling the remote Provider.
//!
//! [`Driver`] is the untyped form: it only accumulates a dotted path and
//! hands it to [`Communicator::submit_call`] when called. The [`driver!`]
//! macro generates a typed client on top of it, one struct per remote
//! interface, with every method turned into an `async fn` returning
//! [`Result`](crate::Result).
//!
//! ```
//! tether::driver! {
//!     /// Client side of the calculator.
//!     pub struct CalculatorDriver {
//!         fn plus(x: f64, y: f64) -> f64;
//!         fn divide(x: f64, y: f64) -> f64;
//!         object nested: NestedDriver;
//!     }
//! }
//!
//! tether::driver! {
//!     pub struct NestedDriver {
//!         fn double(x: f64) -> f64;
//!     }
//! }
//! ```
//!
//! A member whose name the Provider would refuse (leading or trailing `_`,
//! `constructor`, `prototype`) does not compile.

use crate::communicator::WeakCommunicator;
use crate::error::{Result, TetherError};
use crate::path;
use serde_json::Value;

/// Path-building proxy for the remote Provider.
///
/// Cloning is cheap. A Driver does not keep its connection alive; calling
/// through one whose Communicator is gone fails with `Disconnected`.
#[derive(Clone)]
pub struct Driver {
    communicator: WeakCommunicator,
    path: String,
}

impl Driver {
    pub(crate) fn root(communicator: WeakCommunicator) -> Self {
        Self {
            communicator,
            path: String::new(),
        }
    }

    /// The dotted path this proxy stands for; empty at the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// A proxy for `name` under this one.
    pub fn member(&self, name: &str) -> Driver {
        Driver {
            communicator: self.communicator.clone(),
            path: path::join(&self.path, name),
        }
    }

    /// Call the function this proxy stands for.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        let communicator = self
            .communicator
            .upgrade()
            .ok_or_else(|| TetherError::Disconnected {
                reason: "the communicator behind this driver has been dropped".to_string(),
            })?;
        communicator.submit_call(&self.path, args).await
    }

    /// Shorthand for `member(method).call(args)`.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.member(method).call(args).await
    }

    /// Whether both proxies were derived from the same Communicator.
    pub fn same_root(&self, other: &Driver) -> bool {
        self.communicator.ptr_eq(&other.communicator)
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver").field("path", &self.path).finish()
    }
}

/// Generate a typed client for a remote interface.
///
/// Each `fn` becomes an `async fn` that serializes its arguments, calls the
/// member of the same name and deserializes the reply. Each `object` becomes
/// an accessor returning the nested typed driver, which must itself be
/// declared with this macro (or otherwise implement `From<Driver>`).
/// Methods may carry attributes and doc comments; `object` lines may not,
/// and must come after every `fn`.
///
/// ```
/// tether::driver! {
///     pub struct CalculatorDriver {
///         fn plus(x: f64, y: f64) -> f64;
///         object nested: NestedDriver;
///     }
/// }
///
/// tether::driver! {
///     pub struct NestedDriver {
///         fn double(x: f64) -> f64;
///     }
/// }
/// ```
///
/// Members the remote side would refuse cannot be declared at all:
///
/// ```compile_fail
/// tether::driver! {
///     pub struct LeakyDriver {
///         fn constructor() -> ();
///     }
/// }
/// ```
///
/// ```compile_fail
/// tether::driver! {
///     pub struct LeakyDriver {
///         fn _secret() -> u32;
///     }
/// }
/// ```
///
/// ```compile_fail
/// tether::driver! {
///     pub struct LeakyDriver {
///         fn plus(x: f64, y: f64) -> f64;
///         object prototype: InnerDriver;
///     }
/// }
///
/// tether::driver! {
///     pub struct InnerDriver {
///         fn double(x: f64) -> f64;
///     }
/// }
/// ```
#[macro_export]
macro_rules! driver {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fn_meta:meta])*
                fn $method:ident ( $( $arg:ident : $arg_ty:ty ),* $(,)? ) -> $ret:ty ;
            )*
            $(
                object $field:ident : $child:ty ;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        $vis struct $name {
            driver: $crate::Driver,
        }

        impl ::core::convert::From<$crate::Driver> for $name {
            fn from(driver: $crate::Driver) -> Self {
                Self { driver }
            }
        }

        #[allow(dead_code)]
        impl $name {
            /// The untyped proxy behind this client.
            pub fn as_driver(&self) -> &$crate::Driver {
                &self.driver
            }

            $(
                $(#[$fn_meta])*
                pub async fn $method(&self, $( $arg : $arg_ty ),* ) -> $crate::Result<$ret> {
                    const _: () = ::core::assert!(
                        $crate::path::is_exposable(::core::stringify!($method)),
                        ::core::concat!("member cannot be exposed remotely: ", ::core::stringify!($method)),
                    );
                    let args: ::std::vec::Vec<$crate::serde_json::Value> = ::std::vec![
                        $( $crate::serde_json::to_value(&$arg)? ),*
                    ];
                    let value = self
                        .driver
                        .invoke(::core::stringify!($method), args)
                        .await?;
                    ::core::result::Result::Ok($crate::serde_json::from_value(value)?)
                }
            )*

            $(
                pub fn $field(&self) -> $child {
                    const _: () = ::core::assert!(
                        $crate::path::is_exposable(::core::stringify!($field)),
                        ::core::concat!("member cannot be exposed remotely: ", ::core::stringify!($field)),
                    );
                    <$child as ::core::convert::From<$crate::Driver>>::from(
                        self.driver.member(::core::stringify!($field)),
                    )
                }
            )*
        }
    };
}
