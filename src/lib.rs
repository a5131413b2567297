// SPDX-FileCopyrightText: 2024-2025 reticket contributors
// SPDX-License-Identifier: GPL-3.0-only

//! reticket is primarily an application; the Rust API exists for the CLI
//! and its tests and can change at any time. The CLI source files use
//! concrete types wherever possible, while the library-style modules aim
//! to be generic over their transports.

pub mod cli;
pub mod device;
pub mod download;
pub mod format;
pub mod ipsw;
pub mod partialzip;
pub mod personalize;
pub mod restore;
pub mod tss;
pub mod util;
pub mod version;
