use kube::CustomResourceExt;
use kulta_updater::crd::release::{ModuleRelease, PlatformRelease};
use serde_json::json;

fn main() -> anyhow::Result<()> {
    // Both CRDs as one v1 List; pipe through a JSON->YAML converter for manifests
    let list = json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            serde_json::to_value(PlatformRelease::crd())?,
            serde_json::to_value(ModuleRelease::crd())?,
        ]
    });

    println!("{}", serde_json::to_string_pretty(&list)?);
    Ok(())
}
