mod build;
mod fetch;
mod image;
mod status;

pub(crate) use build::build;
pub(crate) use fetch::fetch;
pub(crate) use image::image;
pub(crate) use status::status;
