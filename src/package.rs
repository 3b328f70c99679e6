//! Package selection for the `#@` command.
//!
//! Picks the package to send based on the destination address and the
//! configured transport. The local chapter of the International Union of
//! Flying Reindeer imposes strict guidelines on weight and hazardous
//! materials, so deliveries by reindeer are limited to the lightest option.

use std::fmt;

/// How packages get delivered (`#u` command).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Ups,
    Reindeer,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Ups => write!(f, "UPS"),
            TransportMode::Reindeer => write!(f, "REINDEER"),
        }
    }
}

/// Select the package for the given address (zipcode).
///
/// The niceness score is derived from the address alone; the behavioral
/// database never shipped. Refer to ISO-IEC 999:1492.
pub fn select_package(address: i32, transport: TransportMode) -> String {
    let niceness = if transport == TransportMode::Reindeer {
        1 // Rudolf doesn't like to make deliveries anymore
    } else if address > 20000 && address < 20600 {
        0 // adjustment for DC zipcodes
    } else {
        address.rem_euclid(10)
    };

    let pkg = match niceness {
        1 => "1 lb  Lignite",
        2 => "2 lbs Bituminous",
        3 => "2 lbs Anthracite",
        4 => "10 lbs Kingsford Quick Start",
        5 => "Lighter fluid",
        6 => "2 cases of PBR",
        7 => "6-pack PBR",
        8 => "4 elves",
        9 => "2014 Tesla (batteries not included)",
        _ => "A little something from Rudolf", // sorry, bud
    };

    pkg.to_string()
}
