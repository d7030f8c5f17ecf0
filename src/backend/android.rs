//! Managed downloads through `android.app.DownloadManager`
//!
//! Completion is detected by polling; the completion stream of this manager
//! never yields because no broadcast receiver is registered on the Java side.
//!
//! Downloads land in the manager's default destination. Finished files that
//! are only exposed as `content://` URIs are copied out through the
//! application's `ContentResolver`.

use jni::objects::{GlobalRef, JObject, JValue};
use jni::{JNIEnv, JavaVM};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

use super::{DownloadId, DownloadManager, DownloadProgress, DownloadStatus, ManagedRequest};
use crate::{Error, Result};

const VISIBILITY_VISIBLE: i32 = 0;
const VISIBILITY_VISIBLE_NOTIFY_COMPLETED: i32 = 1;
const NETWORK_WIFI_AND_MOBILE: i32 = 3;
const COPY_CHUNK_SIZE: i32 = 64 * 1024;

/// JNI-backed download manager
pub struct AndroidDownloadManager {
    vm: JavaVM,
    context: GlobalRef,
    manager: GlobalRef,
    completions: broadcast::Sender<DownloadId>,
}

fn jni_error(context: &str) -> impl FnOnce(jni::errors::Error) -> Error + '_ {
    move |e| Error::exception(format!("{}: {}", context, e))
}

impl AndroidDownloadManager {
    /// Look up the system `DownloadManager` of the hosting application
    pub fn new() -> Result<Self> {
        let context = ndk_context::android_context();
        let vm = unsafe { JavaVM::from_raw(context.vm().cast()) }
            .map_err(jni_error("Failed to obtain JavaVM"))?;

        let (context, manager) = {
            let mut env = vm
                .attach_current_thread()
                .map_err(jni_error("Failed to attach to JVM thread"))?;
            let app_context = unsafe { JObject::from_raw(context.context().cast()) };
            let context = env
                .new_global_ref(&app_context)
                .map_err(jni_error("Failed to create global ref for the application context"))?;

            let service_name = env
                .new_string("download")
                .map_err(jni_error("Failed to create download service string"))?;
            let manager = env
                .call_method(
                    &app_context,
                    "getSystemService",
                    "(Ljava/lang/String;)Ljava/lang/Object;",
                    &[(&service_name).into()],
                )
                .map_err(jni_error("Failed to get DownloadManager service"))?
                .l()
                .map_err(jni_error("Failed to get DownloadManager object"))?;

            let manager = env
                .new_global_ref(&manager)
                .map_err(jni_error("Failed to create global ref for DownloadManager"))?;

            (context, manager)
        };

        let (completions, _) = broadcast::channel(1);

        Ok(Self {
            vm,
            context,
            manager,
            completions,
        })
    }

    fn build_request<'local>(
        &self,
        env: &mut JNIEnv<'local>,
        request: &ManagedRequest,
    ) -> Result<JObject<'local>> {
        let url = env
            .new_string(request.url.as_str())
            .map_err(jni_error("Failed to create URL string"))?;
        let uri = parse_uri(env, &url)?;

        let download_request = env
            .new_object(
                "android/app/DownloadManager$Request",
                "(Landroid/net/Uri;)V",
                &[(&uri).into()],
            )
            .map_err(jni_error("Failed to create DownloadManager.Request"))?;

        let visibility = if request.notifications_enabled {
            VISIBILITY_VISIBLE_NOTIFY_COMPLETED
        } else {
            VISIBILITY_VISIBLE
        };
        env.call_method(
            &download_request,
            "setNotificationVisibility",
            "(I)Landroid/app/DownloadManager$Request;",
            &[visibility.into()],
        )
        .map_err(jni_error("Failed to set notification visibility"))?;

        env.call_method(
            &download_request,
            "setAllowedNetworkTypes",
            "(I)Landroid/app/DownloadManager$Request;",
            &[NETWORK_WIFI_AND_MOBILE.into()],
        )
        .map_err(jni_error("Failed to set allowed network types"))?;

        let mime_type = env
            .new_string(&request.mime_type)
            .map_err(jni_error("Failed to create MIME type string"))?;
        env.call_method(
            &download_request,
            "setMimeType",
            "(Ljava/lang/String;)Landroid/app/DownloadManager$Request;",
            &[(&mime_type).into()],
        )
        .map_err(jni_error("Failed to set MIME type"))?;

        for (method, value) in [
            ("setTitle", &request.title),
            ("setDescription", &request.description),
        ] {
            if let Some(value) = value {
                let value = env
                    .new_string(value)
                    .map_err(jni_error("Failed to create notification string"))?;
                env.call_method(
                    &download_request,
                    method,
                    "(Ljava/lang/CharSequence;)Landroid/app/DownloadManager$Request;",
                    &[(&value).into()],
                )
                .map_err(jni_error("Failed to set notification text"))?;
            }
        }

        for (name, value) in &request.headers {
            let name = env
                .new_string(name)
                .map_err(jni_error("Failed to create header name"))?;
            let value = env
                .new_string(value)
                .map_err(jni_error("Failed to create header value"))?;
            env.call_method(
                &download_request,
                "addRequestHeader",
                "(Ljava/lang/String;Ljava/lang/String;)Landroid/app/DownloadManager$Request;",
                &[(&name).into(), (&value).into()],
            )
            .map_err(jni_error("Failed to add request header"))?;
        }

        Ok(download_request)
    }
}

fn parse_uri<'local>(env: &mut JNIEnv<'local>, value: &JObject<'_>) -> Result<JObject<'local>> {
    env.call_static_method(
        "android/net/Uri",
        "parse",
        "(Ljava/lang/String;)Landroid/net/Uri;",
        &[value.into()],
    )
    .map_err(jni_error("Failed to parse URI"))?
    .l()
    .map_err(jni_error("Failed to get URI object"))
}

fn column_index(env: &mut JNIEnv<'_>, cursor: &JObject<'_>, column: &str) -> Result<i32> {
    let column = env
        .new_string(column)
        .map_err(jni_error("Failed to create column name"))?;
    env.call_method(
        cursor,
        "getColumnIndex",
        "(Ljava/lang/String;)I",
        &[(&column).into()],
    )
    .map_err(jni_error("Failed to get column index"))?
    .i()
    .map_err(jni_error("Failed to convert column index"))
}

fn read_row(env: &mut JNIEnv<'_>, cursor: &JObject<'_>) -> Result<DownloadProgress> {
    let status_index = column_index(env, cursor, "status")?;
    let so_far_index = column_index(env, cursor, "bytes_so_far")?;
    let total_index = column_index(env, cursor, "total_size")?;
    let uri_index = column_index(env, cursor, "local_uri")?;

    let status = env
        .call_method(cursor, "getInt", "(I)I", &[status_index.into()])
        .map_err(jni_error("Failed to get status value"))?
        .i()
        .map_err(jni_error("Failed to convert status value"))?;
    let bytes_so_far = env
        .call_method(cursor, "getLong", "(I)J", &[so_far_index.into()])
        .map_err(jni_error("Failed to get downloaded bytes"))?
        .j()
        .map_err(jni_error("Failed to convert downloaded bytes"))?;
    let bytes_total = env
        .call_method(cursor, "getLong", "(I)J", &[total_index.into()])
        .map_err(jni_error("Failed to get total bytes"))?
        .j()
        .map_err(jni_error("Failed to convert total bytes"))?;
    let local_uri = env
        .call_method(cursor, "getString", "(I)Ljava/lang/String;", &[uri_index.into()])
        .map_err(jni_error("Failed to get local URI"))?
        .l()
        .map_err(jni_error("Failed to convert local URI"))?;

    let local_path = if local_uri.is_null() {
        None
    } else {
        let uri: String = env
            .get_string(&local_uri.into())
            .map_err(jni_error("Failed to read local URI"))?
            .into();
        // content:// URIs are left to `export`
        uri.strip_prefix("file://").map(PathBuf::from)
    };

    Ok(DownloadProgress {
        status: DownloadStatus::from(status),
        bytes_so_far: u64::try_from(bytes_so_far).unwrap_or(0),
        bytes_total: u64::try_from(bytes_total).ok().filter(|total| *total > 0),
        local_path,
    })
}

impl DownloadManager for AndroidDownloadManager {
    fn enqueue(&self, request: ManagedRequest) -> Result<DownloadId> {
        let mut env = self
            .vm
            .attach_current_thread()
            .map_err(jni_error("Failed to attach to JVM thread"))?;

        let download_request = self.build_request(&mut env, &request)?;

        let id = env
            .call_method(
                self.manager.as_obj(),
                "enqueue",
                "(Landroid/app/DownloadManager$Request;)J",
                &[(&download_request).into()],
            )
            .map_err(jni_error("Failed to enqueue download"))?
            .j()
            .map_err(jni_error("Failed to get download ID"))?;

        tracing::debug!("Enqueued DownloadManager download {} for task {}", id, request.task_id);
        Ok(id)
    }

    fn query(&self, id: DownloadId) -> Result<Option<DownloadProgress>> {
        let mut env = self
            .vm
            .attach_current_thread()
            .map_err(jni_error("Failed to attach to JVM thread"))?;

        let query = env
            .new_object("android/app/DownloadManager$Query", "()V", &[])
            .map_err(jni_error("Failed to create DownloadManager.Query"))?;

        let ids = env
            .new_long_array(1)
            .map_err(jni_error("Failed to create id array"))?;
        env.set_long_array_region(&ids, 0, &[id])
            .map_err(jni_error("Failed to fill id array"))?;
        env.call_method(
            &query,
            "setFilterById",
            "([J)Landroid/app/DownloadManager$Query;",
            &[JValue::Object(&ids)],
        )
        .map_err(jni_error("Failed to set filter by ID"))?;

        let cursor = env
            .call_method(
                self.manager.as_obj(),
                "query",
                "(Landroid/app/DownloadManager$Query;)Landroid/database/Cursor;",
                &[(&query).into()],
            )
            .map_err(jni_error("Failed to query download"))?
            .l()
            .map_err(jni_error("Failed to get cursor"))?;

        if cursor.is_null() {
            return Ok(None);
        }

        let has_row = env
            .call_method(&cursor, "moveToFirst", "()Z", &[])
            .map_err(jni_error("Failed to move cursor to first"))?
            .z()
            .map_err(jni_error("Failed to convert cursor result"))?;

        let row = if has_row {
            Some(read_row(&mut env, &cursor))
        } else {
            None
        };

        env.call_method(&cursor, "close", "()V", &[])
            .map_err(jni_error("Failed to close cursor"))?;

        row.transpose()
    }

    fn remove(&self, id: DownloadId) -> Result<()> {
        let mut env = self
            .vm
            .attach_current_thread()
            .map_err(jni_error("Failed to attach to JVM thread"))?;

        let ids = env
            .new_long_array(1)
            .map_err(jni_error("Failed to create id array"))?;
        env.set_long_array_region(&ids, 0, &[id])
            .map_err(jni_error("Failed to fill id array"))?;

        env.call_method(
            self.manager.as_obj(),
            "remove",
            "([J)I",
            &[JValue::Object(&ids)],
        )
        .map_err(jni_error("Failed to remove download"))?;

        Ok(())
    }

    fn completions(&self) -> broadcast::Receiver<DownloadId> {
        self.completions.subscribe()
    }

    fn export(&self, id: DownloadId, destination: &Path) -> Result<()> {
        let mut env = self
            .vm
            .attach_current_thread()
            .map_err(jni_error("Failed to attach to JVM thread"))?;

        let uri = env
            .call_method(
                self.manager.as_obj(),
                "getUriForDownloadedFile",
                "(J)Landroid/net/Uri;",
                &[id.into()],
            )
            .map_err(jni_error("Failed to get downloaded file URI"))?
            .l()
            .map_err(jni_error("Failed to convert downloaded file URI"))?;
        if uri.is_null() {
            return Err(Error::exception(format!(
                "Managed download {} has no local file",
                id
            )));
        }

        let resolver = env
            .call_method(
                self.context.as_obj(),
                "getContentResolver",
                "()Landroid/content/ContentResolver;",
                &[],
            )
            .map_err(jni_error("Failed to get ContentResolver"))?
            .l()
            .map_err(jni_error("Failed to convert ContentResolver"))?;
        let input = env
            .call_method(
                &resolver,
                "openInputStream",
                "(Landroid/net/Uri;)Ljava/io/InputStream;",
                &[(&uri).into()],
            )
            .map_err(jni_error("Failed to open downloaded file"))?
            .l()
            .map_err(jni_error("Failed to convert input stream"))?;

        let copied = copy_stream(&mut env, &input, destination);

        env.call_method(&input, "close", "()V", &[])
            .map_err(jni_error("Failed to close input stream"))?;

        copied
    }
}

fn copy_stream(env: &mut JNIEnv<'_>, input: &JObject<'_>, destination: &Path) -> Result<()> {
    let mut file = std::fs::File::create(destination).map_err(|e| {
        Error::exception(format!("Failed to create {}: {}", destination.display(), e))
    })?;

    let buffer = env
        .new_byte_array(COPY_CHUNK_SIZE)
        .map_err(jni_error("Failed to create copy buffer"))?;
    let mut chunk = vec![0i8; COPY_CHUNK_SIZE as usize];

    loop {
        let read = env
            .call_method(input, "read", "([B)I", &[JValue::Object(&buffer)])
            .map_err(jni_error("Failed to read downloaded file"))?
            .i()
            .map_err(jni_error("Failed to convert read count"))?;
        let Ok(read) = usize::try_from(read) else {
            break;
        };

        env.get_byte_array_region(&buffer, 0, &mut chunk[..read])
            .map_err(jni_error("Failed to copy from Java buffer"))?;
        let bytes: Vec<u8> = chunk[..read].iter().map(|b| *b as u8).collect();
        file.write_all(&bytes).map_err(|e| {
            Error::exception(format!("Failed to write {}: {}", destination.display(), e))
        })?;
    }

    file.flush()
        .map_err(|e| Error::exception(format!("Failed to flush {}: {}", destination.display(), e)))
}
