// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

pub(crate) mod descriptor;
pub(crate) mod index;
pub(crate) mod manager;


pub use descriptor::Region;
