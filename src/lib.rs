// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Recursive container dispatcher and application-manifest signer core.

This crate coordinates code-signing across nested containers (zip
archives, Appx/Msix packages and bundles) and ClickOnce/VSTO deployment
manifests, without implementing any primitive signature format itself —
those are invoked through the [capabilities] and [leaf_signer] traits as
opaque, uniform capabilities.

*/

pub mod aggregating_signer;
pub mod capabilities;
pub mod config;
pub mod container;
pub mod error;
pub mod fileref;
pub mod glob_matcher;
pub mod leaf_signer;
pub mod logging;
pub mod manifest_signer;
pub mod options;
pub mod pe_probe;

#[cfg(test)]
pub mod testutil;

pub use crate::{
    aggregating_signer::AggregatingSigner,
    error::SigningError,
    fileref::FileRef,
    manifest_signer::ApplicationManifestSigner,
    options::{SigningOptions, SigningOptionsBuilder},
};
