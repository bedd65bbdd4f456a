//! Browser console script that installs an exported identity

use super::{ExportArtifact, IDENTITY_ENTRY};

/// Render the script an operator pastes into the target dApp's tab.
///
/// The script imports the JWK through WebCrypto, then opens the auth
/// client's IndexedDB store, deletes the listed entries and stores the
/// imported key under `identity`.
pub fn render_import_script(artifact: &ExportArtifact) -> String {
    let jwk = serde_json::to_string_pretty(&artifact.key).unwrap_or_default();
    let algorithm = serde_json::to_string(&artifact.algorithm).unwrap_or_default();
    let usages = serde_json::to_string(&artifact.usages).unwrap_or_default();
    let database = quote(&artifact.storage.database);
    let store = quote(&artifact.storage.store);
    let identity = quote(IDENTITY_ENTRY);

    let deletes: String = artifact
        .storage
        .delete
        .iter()
        .map(|entry| format!("            store.delete({});\n", quote(entry)))
        .collect();

    format!(
        r#"// Paste this script in the console of the browser tab where the target dApp is loaded.
// Forged identity {fingerprint} issued {issued_at}
const jwkEcKey = {jwk};

window.crypto.subtle.importKey("jwk", jwkEcKey, {algorithm}, {extractable}, {usages})
    .then((key) => {{
        const connection = indexedDB.open({database}, 1);
        connection.onsuccess = (e) => {{
            const db = e.target.result;
            const trx = db.transaction({store}, "readwrite");
            const store = trx.objectStore({store});
{deletes}            store.put(key, {identity});
        }};
    }});
"#,
        fingerprint = artifact.fingerprint,
        issued_at = artifact.issued_at.to_rfc3339(),
        extractable = artifact.extractable,
    )
}

fn quote(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".into())
}
