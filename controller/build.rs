fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=WIFI_SSID");
    println!("cargo:rerun-if-env-changed=WIFI_PASS");

    // The host simulation links against nothing from ESP-IDF.
    #[cfg(feature = "esp32")]
    embuild::espidf::sysenv::output();
}
