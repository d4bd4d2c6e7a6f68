use anyhow::{bail, Context, Result};
use netmesh_kernel::link::LinkTable;
use rtnetlink::Handle;

/// Enumerates host interfaces and resolves the sole non-loopback device
/// whose name starts with `eth` or `en`. Used when `targetLinkName` is
/// left empty in config.
pub async fn detect_underlay(handle: Handle) -> Result<String> {
    let links = LinkTable::new(handle)
        .list_by_prefix("")
        .await
        .context("listing interfaces for underlay auto-detection")?;

    let candidates: Vec<String> = links
        .into_iter()
        .map(|link| link.name)
        .filter(|name| name != "lo")
        .filter(|name| name.starts_with("eth") || name.starts_with("en"))
        .collect();

    match candidates.as_slice() {
        [single] => Ok(single.clone()),
        [] => bail!("no underlay device found: no eth*/en* interface is present"),
        many => bail!("ambiguous underlay device: {} candidates found ({})", many.len(), many.join(", ")),
    }
}
