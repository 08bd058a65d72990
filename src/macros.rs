//! Table-generating macros shared by the protocol and error modules.

/// Generates the `ClusterCommand` enum for the 0xEF00 cluster along with
/// lookup helpers from the raw command id.
macro_rules! define_cluster_commands {
    ($($name:ident = $val:literal),* $(,)?) => {
        /// Command ids of the Tuya manufacturer cluster (0xEF00).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum ClusterCommand {
            $($name = $val),*
        }

        impl ClusterCommand {
            pub fn from_u8(val: u8) -> Option<Self> {
                match val {
                    $($val => Some(Self::$name),)*
                    _ => None,
                }
            }

            pub fn id(self) -> u8 {
                self as u8
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)*
                }
            }
        }

        impl std::fmt::Display for ClusterCommand {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}(0x{:02X})", self.name(), *self as u8)
            }
        }
    };
}

/// Generates numeric health codes and their human-readable descriptions.
macro_rules! define_health_codes {
    ($($name:ident = $val:literal => $msg:literal),* $(,)?) => {
        $(pub const $name: u32 = $val;)*

        pub fn get_health_message(code: u32) -> &'static str {
            match code {
                $($val => $msg,)*
                _ => "Unknown Health Code",
            }
        }
    };
}
