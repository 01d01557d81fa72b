pub(crate) mod dotify;
pub(crate) mod fencins;
pub(crate) mod helpers;
pub(crate) mod reach;
