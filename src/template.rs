//! HTML wrapper extraction from the build output's root HTML file.
//!
//! The root HTML file of a client build contains a mount container
//! (`<div id="root"></div>` by default) and a module script tag. The
//! runner writes everything up to and including the container's opening
//! tag before the rendered markup, and everything from the container's
//! closing tag onwards after it.

use lol_html::html_content::ContentType;
use lol_html::{element, rewrite_str, RewriteStrSettings};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

/// Default id of the mount container element.
pub const DEFAULT_MOUNT_ID: &str = "root";

const OPEN_MARK: &str = "<!--ssr-relay:mount-->";
const CLOSE_MARK: &str = "<!--/ssr-relay:mount-->";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlTemplate {
    /// Markup preceding the rendered output.
    pub head: String,
    /// Markup following the rendered output.
    pub tail: String,
    /// `src` of the client entry script, if the page has one.
    pub script_src: Option<String>,
}

#[derive(Default)]
struct Scan {
    mounts: usize,
    void_mount: bool,
    script_src: Option<String>,
}

impl HtmlTemplate {
    /// Split `html` around the first element whose `id` is `mount_id`.
    ///
    /// Any existing children of the container are dropped; they are
    /// replaced by the server-rendered markup.
    pub fn parse(html: &str, mount_id: &str) -> Result<Self, String> {
        if mount_id.is_empty()
            || mount_id
                .chars()
                .any(|c| c == '"' || c == '\\' || c.is_whitespace() || c.is_control())
        {
            return Err(format!("invalid mount id {:?}", mount_id));
        }
        if html.contains(OPEN_MARK) || html.contains(CLOSE_MARK) {
            return Err("template contains reserved ssr-relay comments".to_string());
        }

        let scan = Rc::new(RefCell::new(Scan::default()));
        let rewritten = rewrite_str(
            html,
            RewriteStrSettings {
                element_content_handlers: vec![
                    element!(format!("[id=\"{}\"]", mount_id), {
                        let scan = Rc::clone(&scan);
                        move |el| {
                            let mut scan = scan.borrow_mut();
                            scan.mounts += 1;
                            if scan.mounts > 1 {
                                return Ok(());
                            }
                            if !el.can_have_content() {
                                scan.void_mount = true;
                                return Ok(());
                            }
                            // Children in between the marks are discarded below.
                            el.prepend(OPEN_MARK, ContentType::Html);
                            el.append(CLOSE_MARK, ContentType::Html);
                            Ok(())
                        }
                    }),
                    element!("script[src]", {
                        let scan = Rc::clone(&scan);
                        move |el| {
                            let mut scan = scan.borrow_mut();
                            if scan.script_src.is_none() {
                                scan.script_src = el.get_attribute("src");
                            }
                            Ok(())
                        }
                    }),
                ],
                ..RewriteStrSettings::default()
            },
        )
        .map_err(|e| format!("unparseable HTML: {}", e))?;

        let scan = scan.borrow();
        if scan.mounts == 0 {
            return Err(format!("no element with id=\"{}\" found", mount_id));
        }
        if scan.void_mount {
            return Err(format!("element with id=\"{}\" cannot have content", mount_id));
        }
        let open = rewritten
            .find(OPEN_MARK)
            .ok_or_else(|| format!("element with id=\"{}\" has no content position", mount_id))?;
        let close = rewritten
            .find(CLOSE_MARK)
            .ok_or_else(|| format!("element with id=\"{}\" is never closed", mount_id))?;

        Ok(Self {
            head: rewritten[..open].to_string(),
            tail: rewritten[close + CLOSE_MARK.len()..].to_string(),
            script_src: scan.script_src.clone(),
        })
    }
}
