//! Run-time tunables, read once from the environment at init.
//!
//! Each option carries a default and a validator.  Environment variables use
//! the `GC_` prefix with the upper-cased option name, e.g.
//! `GC_FREE_SPACE_DIVISOR=2`.  Booleans accept `1`/`true`/`0`/`false`.

use std::fmt::Debug;
use std::str::FromStr;

/// A single typed option with a validity check.
#[derive(Clone)]
pub struct GcOption<T: Debug + Clone> {
    value: T,
    validator: fn(&T) -> bool,
}

impl<T: Debug + Clone> GcOption<T> {
    fn new(value: T, validator: fn(&T) -> bool) -> Self {
        GcOption { value, validator }
    }

    /// Set the option.  Returns false (leaving the value unchanged) if the
    /// candidate fails validation.
    pub fn set(&mut self, value: T) -> bool {
        if (self.validator)(&value) {
            self.value = value;
            return true;
        }
        false
    }
}

impl<T: Debug + Clone> std::ops::Deref for GcOption<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "true" | "TRUE" => Some(true),
        "0" | "false" | "FALSE" => Some(false),
        _ => None,
    }
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $ty:tt [$env:literal] [$validator:expr] = $default:expr;)*) => {
        /// The collector's tunables.
        #[derive(Clone)]
        pub struct Options {
            $($(#[$outer])* pub $name: GcOption<$ty>,)*
        }

        impl Default for Options {
            fn default() -> Self {
                Options {
                    $($name: GcOption::new($default, $validator),)*
                }
            }
        }

        impl Options {
            /// Build the option set, overriding defaults from the
            /// environment.  Unparsable or invalid values are ignored with a
            /// warning; the collector must come up regardless.
            pub fn from_env() -> Self {
                let mut options = Options::default();
                $(
                    if let Ok(raw) = std::env::var($env) {
                        if !options.set_from_str(stringify!($name), &raw) {
                            warn!("ignoring invalid {}={}", $env, raw);
                        }
                    }
                )*
                options
            }

            /// Set one option from its string form.  Returns false on an
            /// unknown name, a parse failure, or a validation failure.
            pub fn set_from_str(&mut self, name: &str, raw: &str) -> bool {
                match name {
                    $(stringify!($name) => {
                        match options!(@parse $ty, raw) {
                            Some(v) => self.$name.set(v),
                            None => false,
                        }
                    })*
                    _ => false,
                }
            }
        }
    };
    (@parse bool, $raw:expr) => { parse_bool($raw) };
    (@parse $ty:ty, $raw:expr) => { <$ty as FromStr>::from_str($raw).ok() };
}

options! {
    /// Divisor in the collection trigger: collect once allocation since the
    /// last cycle reaches (heap + roots) / divisor.  Smaller is more eager.
    free_space_divisor: usize ["GC_FREE_SPACE_DIVISOR"] [|v| *v > 0] = 4;
    /// Blocks acquired from the OS at init.
    initial_heap_blocks: usize ["GC_INITIAL_HEAP_BLOCKS"] [|v| *v > 0]
        = crate::util::constants::MINHINCR;
    /// Cap on the doubling heap increment, in blocks.
    max_heap_increment: usize ["GC_MAX_HEAP_INCREMENT"]
        [|v| *v >= crate::util::constants::MINHINCR]
        = crate::util::constants::MAXHINCR;
    /// Emit per-collection statistics at info level instead of debug.
    print_stats: bool ["GC_PRINT_STATS"] [|_| true] = false;
    /// Never collect; the heap only grows.  For debugging clients.
    dont_gc: bool ["GC_DONT_GC"] [|_| true] = false;
    /// Never expand the heap beyond the initial allocation.
    dont_expand: bool ["GC_DONT_EXPAND"] [|_| true] = false;
    /// Treat every interior pointer as valid instead of only registered
    /// displacements.  Inflates object sizes by one word.
    all_interior_pointers: bool ["GC_ALL_INTERIOR_POINTERS"] [|_| true] = false;
    /// Refill failures tolerated (with a warning and a forced collection)
    /// before the out-of-memory condition becomes fatal.
    max_retries: usize ["GC_MAX_RETRIES"] [|_| true] = 20;
    /// Keep everything reachable from the finalization queue alive during
    /// finalization, and finalize unreachable-kind objects eagerly.
    java_finalization: bool ["GC_JAVA_FINALIZATION"] [|_| true] = false;
    /// Do not run finalizers from allocation entry points; the client calls
    /// `invoke_finalizers` itself.
    finalize_on_demand: bool ["GC_FINALIZE_ON_DEMAND"] [|_| true] = false;
}
