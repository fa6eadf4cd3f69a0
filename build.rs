#[cfg(feature = "tauri-app")]
fn main() {
    println!("cargo:rerun-if-changed=windows-app-manifest.xml");

    let windows = tauri_build::WindowsAttributes::new()
        .app_manifest(include_str!("windows-app-manifest.xml"));
    let attrs = tauri_build::Attributes::new().windows_attributes(windows);

    tauri_build::try_build(attrs).expect("failed to run build script")
}

#[cfg(not(feature = "tauri-app"))]
fn main() {}
