use std::path::Path;

use anyhow::Result;
use package_build::image::{self, ImageTarget};

pub(crate) fn image(
    root: &Path,
    target: &str,
    extra: &[String],
    match_filter: Option<&str>,
) -> Result<()> {
    let target = ImageTarget::parse(target);
    let match_filter = match_filter.filter(|filter| !filter.is_empty());
    image::run_target(root, &target, extra, match_filter)
}
