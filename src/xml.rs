//! XML documents the gateway writes on its own behalf.
//!
//! Everything the gateway synthesizes itself (errors, Swift listings
//! reshaped as S3, static sub-resource documents, multipart results) is
//! written here with `quick-xml`. The one client document the gateway
//! reads, `<CompleteMultipartUpload>`, is parsed here too.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

use crate::errors::S3Error;

const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";
const XSI_XMLNS: &str = "http://www.w3.org/2001/XMLSchema-instance";

type XmlWriter = Writer<Cursor<Vec<u8>>>;

/// `<Error>` with code, message, resource and request id.
pub fn render_error(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut writer = start_document();
    write_simple_element_group(
        &mut writer,
        "Error",
        &[
            ("Code", code),
            ("Message", message),
            ("Resource", resource),
            ("RequestId", request_id),
        ],
    );
    finish(writer)
}

// Listings

/// One `<Contents>` entry of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub key: String,
    pub last_modified: String,
    pub etag: String,
    pub size: u64,
    pub storage_class: String,
}

/// A ListObjectsV2 result ready to render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListBucketResult {
    pub name: String,
    pub prefix: String,
    pub delimiter: String,
    pub max_keys: u32,
    pub is_truncated: bool,
    pub key_count: u32,
    pub contents: Vec<ListEntry>,
    pub common_prefixes: Vec<String>,
    pub continuation_token: Option<String>,
    pub next_continuation_token: Option<String>,
    pub start_after: Option<String>,
}

/// Render `<ListBucketResult>` for ListObjectsV2.
pub fn render_list_bucket_result(result: &ListBucketResult) -> String {
    let mut writer = start_document();
    start_root(&mut writer, "ListBucketResult");

    write_text_element(&mut writer, "Name", &result.name);
    write_text_element(&mut writer, "Prefix", &result.prefix);
    if !result.delimiter.is_empty() {
        write_text_element(&mut writer, "Delimiter", &result.delimiter);
    }
    write_text_element(&mut writer, "MaxKeys", &result.max_keys.to_string());
    write_text_element(&mut writer, "KeyCount", &result.key_count.to_string());
    write_text_element(&mut writer, "IsTruncated", bool_text(result.is_truncated));

    if let Some(token) = &result.continuation_token {
        write_text_element(&mut writer, "ContinuationToken", token);
    }
    if let Some(token) = &result.next_continuation_token {
        write_text_element(&mut writer, "NextContinuationToken", token);
    }
    if let Some(start_after) = result.start_after.as_deref().filter(|s| !s.is_empty()) {
        write_text_element(&mut writer, "StartAfter", start_after);
    }

    for entry in &result.contents {
        write_simple_element_group(
            &mut writer,
            "Contents",
            &[
                ("Key", &entry.key),
                ("LastModified", &entry.last_modified),
                ("ETag", &entry.etag),
                ("Size", &entry.size.to_string()),
                ("StorageClass", &entry.storage_class),
            ],
        );
    }

    for prefix in &result.common_prefixes {
        write_simple_element_group(&mut writer, "CommonPrefixes", &[("Prefix", prefix)]);
    }

    end_element(&mut writer, "ListBucketResult");
    finish(writer)
}

/// Body of a successful server-side copy.
pub fn render_copy_object_result(etag: &str, last_modified: &str) -> String {
    let mut writer = start_document();
    write_simple_element_group(
        &mut writer,
        "CopyObjectResult",
        &[("ETag", etag), ("LastModified", last_modified)],
    );
    finish(writer)
}

// ── Multipart uploads ───────────────────────────────────────────────

/// Body answering a new multipart upload.
pub fn render_initiate_multipart_upload_result(bucket: &str, key: &str, upload_id: &str) -> String {
    let mut writer = start_document();
    start_root(&mut writer, "InitiateMultipartUploadResult");
    write_text_element(&mut writer, "Bucket", bucket);
    write_text_element(&mut writer, "Key", key);
    write_text_element(&mut writer, "UploadId", upload_id);
    end_element(&mut writer, "InitiateMultipartUploadResult");
    finish(writer)
}

/// Body answering a completed multipart upload.
pub fn render_complete_multipart_upload_result(
    location: &str,
    bucket: &str,
    key: &str,
    etag: &str,
) -> String {
    let mut writer = start_document();
    start_root(&mut writer, "CompleteMultipartUploadResult");
    write_text_element(&mut writer, "Location", location);
    write_text_element(&mut writer, "Bucket", bucket);
    write_text_element(&mut writer, "Key", key);
    write_text_element(&mut writer, "ETag", etag);
    end_element(&mut writer, "CompleteMultipartUploadResult");
    finish(writer)
}

/// One `<Part>` of a `<CompleteMultipartUpload>` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    /// As sent by the client, quotes included.
    pub etag: String,
}

/// Parts listed in a `<CompleteMultipartUpload>` body, in document order.
pub fn parse_complete_multipart_upload(body: &[u8]) -> Result<Vec<CompletedPart>, S3Error> {
    #[derive(PartialEq)]
    enum Field {
        None,
        PartNumber,
        ETag,
    }

    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut parts = Vec::new();
    let mut in_part = false;
    let mut field = Field::None;
    let mut part_number: Option<u32> = None;
    let mut etag: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"Part" => {
                    in_part = true;
                    part_number = None;
                    etag = None;
                }
                b"PartNumber" if in_part => field = Field::PartNumber,
                b"ETag" if in_part => field = Field::ETag,
                _ => field = Field::None,
            },
            Ok(Event::Text(text)) if field != Field::None => {
                let text = text.unescape().map_err(|_| S3Error::MalformedXML)?;
                match field {
                    Field::PartNumber => part_number = text.trim().parse().ok(),
                    Field::ETag => etag = Some(text.trim().to_string()),
                    Field::None => {}
                }
            }
            Ok(Event::End(e)) => {
                field = Field::None;
                if e.name().as_ref() == b"Part" {
                    in_part = false;
                    let (Some(part_number), Some(etag)) = (part_number.take(), etag.take()) else {
                        return Err(S3Error::MalformedXML);
                    };
                    parts.push(CompletedPart { part_number, etag });
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            Ok(_) => {}
        }
        buf.clear();
    }

    if parts.is_empty() {
        return Err(S3Error::MalformedXML);
    }
    Ok(parts)
}

// ── CreateBucketConfiguration ───────────────────────────────────────

/// Body for creating a bucket in `region` on an S3 backend.
pub fn render_create_bucket_configuration(region: &str) -> String {
    let mut writer = start_document();
    start_root(&mut writer, "CreateBucketConfiguration");
    write_text_element(&mut writer, "LocationConstraint", region);
    end_element(&mut writer, "CreateBucketConfiguration");
    finish(writer)
}

// ── Sub-resource documents ──────────────────────────────────────────

/// An empty configuration document such as `<VersioningConfiguration/>`.
pub fn render_empty_configuration(root: &str) -> String {
    let mut writer = start_document();
    let elem = BytesStart::new(root).with_attributes([("xmlns", S3_XMLNS)]);
    writer.write_event(Event::Empty(elem)).expect("empty root");
    finish(writer)
}

/// `<Tagging>` with an empty tag set.
pub fn render_empty_tagging() -> String {
    let mut writer = start_document();
    start_root(&mut writer, "Tagging");
    writer
        .write_event(Event::Empty(BytesStart::new("TagSet")))
        .expect("empty TagSet");
    end_element(&mut writer, "Tagging");
    finish(writer)
}

/// Grants on a bucket ACL besides the owner's implicit FULL_CONTROL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublicGrants {
    pub read: bool,
    pub write: bool,
}

/// Render `<AccessControlPolicy>` with the owner's FULL_CONTROL grant and
/// an AllUsers grant per public permission.
pub fn render_access_control_policy(owner: &str, grants: PublicGrants) -> String {
    let mut writer = start_document();
    start_root(&mut writer, "AccessControlPolicy");
    write_simple_element_group(
        &mut writer,
        "Owner",
        &[("ID", owner), ("DisplayName", owner)],
    );

    start_element(&mut writer, "AccessControlList");

    write_grant(&mut writer, "CanonicalUser", "ID", owner, "FULL_CONTROL");
    let all_users = "http://acs.amazonaws.com/groups/global/AllUsers";
    if grants.read {
        write_grant(&mut writer, "Group", "URI", all_users, "READ");
    }
    if grants.write {
        write_grant(&mut writer, "Group", "URI", all_users, "WRITE");
    }

    end_element(&mut writer, "AccessControlList");
    end_element(&mut writer, "AccessControlPolicy");
    finish(writer)
}

fn write_grant(writer: &mut XmlWriter, kind: &str, id_tag: &str, id: &str, permission: &str) {
    start_element(writer, "Grant");
    let grantee = BytesStart::new("Grantee")
        .with_attributes([("xmlns:xsi", XSI_XMLNS), ("xsi:type", kind)]);
    writer
        .write_event(Event::Start(grantee))
        .expect("start Grantee");
    write_text_element(writer, id_tag, id);
    end_element(writer, "Grantee");
    write_text_element(writer, "Permission", permission);
    end_element(writer, "Grant");
}

// Writer plumbing. The sink is a Vec, so write errors are impossible.

fn start_document() -> XmlWriter {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("xml decl");
    writer
}

fn finish(writer: XmlWriter) -> String {
    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

fn start_root(writer: &mut XmlWriter, tag: &str) {
    let root = BytesStart::new(tag).with_attributes([("xmlns", S3_XMLNS)]);
    writer.write_event(Event::Start(root)).expect("start root");
}

fn start_element(writer: &mut XmlWriter, tag: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .expect("start tag");
}

fn end_element(writer: &mut XmlWriter, tag: &str) {
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .expect("end tag");
}

fn write_text_element(writer: &mut XmlWriter, tag: &str, text: &str) {
    start_element(writer, tag);
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("text");
    end_element(writer, tag);
}

/// `<parent>` wrapping one text child per pair.
fn write_simple_element_group(writer: &mut XmlWriter, parent: &str, children: &[(&str, &str)]) {
    start_element(writer, parent);
    for (tag, value) in children {
        write_text_element(writer, tag, value);
    }
    end_element(writer, parent);
}

fn bool_text(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}
