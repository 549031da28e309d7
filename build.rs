fn main() {
    // APP_VERSION: CI pins it through RELEASE_VERSION; anything built
    // locally takes the manifest version with a -dev marker on debug
    // profiles so stray helper binaries are recognizable in logs.
    let app_version = match std::env::var("RELEASE_VERSION") {
        Ok(pinned) => pinned,
        Err(_) => {
            let manifest = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
            if matches!(std::env::var("PROFILE").as_deref(), Ok("debug")) {
                format!("{manifest}-dev")
            } else {
                manifest
            }
        }
    };
    println!("cargo:rustc-env=APP_VERSION={app_version}");

    // Windows-specific resource embedding
    #[cfg(windows)]
    {
        let mut res = winres::WindowsResource::new();

        res.set("ProductName", "Raspberry Pi Imager Disk Writer Helper");
        res.set(
            "FileDescription",
            "Performs raw disk writes on behalf of Raspberry Pi Imager",
        );
        res.set("FileVersion", &app_version);
        res.set("ProductVersion", &app_version);

        if let Err(e) = res.compile() {
            eprintln!("Warning: Failed to compile Windows resources: {}", e);
        }
    }

    #[cfg(all(target_os = "windows", not(debug_assertions)))]
    {
        // Embed the requireAdministrator manifest in release builds so a bare
        // double-click of the helper still triggers UAC. The embed-resource
        // crate needs a .rc file, not a raw manifest.
        let manifest_path = std::path::PathBuf::from("rpi-imager-helper.manifest");
        if manifest_path.exists() {
            embed_resource::compile("rpi-imager-helper.rc", embed_resource::NONE);
        }
    }
}
