// src/definition/parser.rs

//! Definition text parser

use super::{Definition, DefinitionError, FileCopy, Header, Section, SectionBody, SectionKind};

/// Section being collected
struct OpenSection {
    kind: SectionKind,
    args: String,
    lines: Vec<(usize, String)>,
}

/// Parse definition text
///
/// The header runs until the first `%section` line. Blank lines and `#`
/// comments are ignored in the header; section bodies are kept verbatim
/// apart from trailing blank lines.
pub fn parse(text: &str) -> Result<Definition, DefinitionError> {
    let mut header = Header::default();
    let mut sections = Vec::new();
    let mut current: Option<OpenSection> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim();

        if let Some(rest) = trimmed.strip_prefix('%') {
            if let Some(open) = current.take() {
                sections.push(close_section(open)?);
            }
            let (name, args) = match rest.split_once(char::is_whitespace) {
                Some((name, args)) => (name, args.trim()),
                None => (rest, ""),
            };
            let kind = name
                .parse::<SectionKind>()
                .map_err(|name| DefinitionError::UnknownSection {
                    line: line_no,
                    name,
                })?;
            if header.is_empty() {
                return Err(DefinitionError::MissingHeader);
            }
            current = Some(OpenSection {
                kind,
                args: args.to_string(),
                lines: Vec::new(),
            });
            continue;
        }

        match current.as_mut() {
            Some(open) => open.lines.push((line_no, raw.to_string())),
            None => {
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                let (key, value) = trimmed
                    .split_once(':')
                    .filter(|(k, _)| !k.trim().is_empty() && !k.trim().contains(char::is_whitespace))
                    .ok_or_else(|| DefinitionError::MalformedHeaderLine {
                        line: line_no,
                        content: trimmed.to_string(),
                    })?;
                header.insert(key.trim(), value.trim());
            }
        }
    }

    if let Some(open) = current.take() {
        sections.push(close_section(open)?);
    }

    if header.is_empty() {
        return Err(DefinitionError::MissingHeader);
    }
    if header.get("bootstrap").is_none() {
        return Err(DefinitionError::MissingBootstrap);
    }

    Ok(Definition {
        header,
        sections,
        context_dir: None,
    })
}

fn close_section(mut open: OpenSection) -> Result<Section, DefinitionError> {
    while open
        .lines
        .last()
        .is_some_and(|(_, l)| l.trim().is_empty())
    {
        open.lines.pop();
    }

    let body = if open.kind == SectionKind::Files {
        SectionBody::Files(parse_files(&open.lines)?)
    } else {
        let text: Vec<&str> = open.lines.iter().map(|(_, l)| l.as_str()).collect();
        SectionBody::Text(text.join("\n"))
    };

    Ok(Section {
        kind: open.kind,
        args: open.args,
        body,
    })
}

fn parse_files(lines: &[(usize, String)]) -> Result<Vec<FileCopy>, DefinitionError> {
    let mut files = Vec::new();
    for (line_no, raw) in lines {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        match tokens.as_slice() {
            [source] => files.push(FileCopy::new(*source, *source)),
            [source, dest] => files.push(FileCopy::new(*source, *dest)),
            _ => {
                return Err(DefinitionError::MalformedFilesLine {
                    line: *line_no,
                    content: trimmed.to_string(),
                });
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::BootstrapKind;

    const FULL: &str = r#"# build a small image
Bootstrap: docker
From: alpine:3.19

%setup
    touch ${IMGBUILD_ROOTFS}/setup-marker

%files
    app.conf /etc/app.conf
    README

%post -c /bin/bash
    echo "hello" > /etc/motd
    if [ -f /etc/app.conf ]; then
        echo ok
    fi

%environment
    export LANG=C

%labels
    Maintainer ops@example.com

%runscript
    exec /bin/sh "$@"
"#;

    #[test]
    fn test_parse_full_definition() {
        let def = parse(FULL).unwrap();
        assert_eq!(def.bootstrap(), "docker");
        assert_eq!(def.bootstrap_kind().unwrap(), BootstrapKind::Docker);
        assert_eq!(def.get("FROM"), Some("alpine:3.19"));
        assert_eq!(def.sections().len(), 6);

        let kinds: Vec<SectionKind> = def.sections().iter().map(|s| s.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                SectionKind::Setup,
                SectionKind::Files,
                SectionKind::Post,
                SectionKind::Environment,
                SectionKind::Labels,
                SectionKind::Runscript,
            ]
        );

        let files = def.sections()[1].files();
        assert_eq!(files[0], FileCopy::new("app.conf", "/etc/app.conf"));
        assert_eq!(files[1], FileCopy::new("README", "README"));

        let post = &def.sections()[2];
        assert_eq!(post.args(), "-c /bin/bash");
        assert!(post.text().contains("        echo ok"));
        assert!(!post.text().ends_with('\n'));
    }

    #[test]
    fn test_round_trip() {
        let def = parse(FULL).unwrap();
        let rendered = def.to_string();
        let reparsed = parse(&rendered).unwrap();
        assert_eq!(def, reparsed);
    }

    #[test]
    fn test_duplicate_header_key_replaces() {
        let def = parse("Bootstrap: docker\nFrom: a\nfrom: b\n").unwrap();
        assert_eq!(def.get("from"), Some("b"));
        assert_eq!(def.header().len(), 2);
    }

    #[test]
    fn test_unknown_section() {
        let err = parse("Bootstrap: scratch\n%install\n  make\n").unwrap_err();
        assert_eq!(
            err,
            DefinitionError::UnknownSection {
                line: 2,
                name: "install".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_files_line() {
        let err = parse("Bootstrap: scratch\n%files\n  a b c\n").unwrap_err();
        assert!(matches!(err, DefinitionError::MalformedFilesLine { line: 3, .. }));
    }

    #[test]
    fn test_section_before_header() {
        let err = parse("\n%post\n  true\n").unwrap_err();
        assert_eq!(err, DefinitionError::MissingHeader);
    }

    #[test]
    fn test_missing_bootstrap() {
        let err = parse("From: alpine\n%post\n  true\n").unwrap_err();
        assert_eq!(err, DefinitionError::MissingBootstrap);
    }

    #[test]
    fn test_malformed_header_line() {
        let err = parse("Bootstrap: scratch\nnot a header\n").unwrap_err();
        assert!(matches!(err, DefinitionError::MalformedHeaderLine { line: 2, .. }));
    }

    #[test]
    fn test_unknown_bootstrap_still_parses() {
        let def = parse("Bootstrap: floppy\n").unwrap();
        assert!(def.bootstrap_kind().is_err());
    }

    #[test]
    fn test_empty_sections() {
        let def = parse("Bootstrap: scratch\n%post\n\n%files\n").unwrap();
        assert_eq!(def.sections()[0].text(), "");
        assert!(def.sections()[1].files().is_empty());
        assert_eq!(parse(&def.to_string()).unwrap(), def);
    }
}
