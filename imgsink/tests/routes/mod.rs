//! Tests that drive the ingestion router in-process, one request at a time, without any listener.
//!
//! Each test gets its own server and therefore its own session, so the single-upload rule is
//! exercised per test.
use crate::common::{
    form_post, post, post_typed, send, wait_for_phase, FailingFactory, Fixture,
};
use crate::Result;
use axum::body::Body;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use imgsink::{Phase, PeerIdentity, SourceContentType};
use imgsink_testing::tar::{snappy_compress, TarBuilder, TestEntry};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;

fn random_image(size: usize) -> Vec<u8> {
    TestEntry::random_file("image", size).data
}

/// HEAD on the async paths is how clients discover async support.  It answers in every phase and
/// never touches the session.
#[test]
fn head_probes_async_paths() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;
        let router = server.router();

        async fn probe_all(router: &axum::Router) -> Result<()> {
            for path in imgsink::UPLOAD_ASYNC_PATHS
                .iter()
                .chain(imgsink::UPLOAD_FORM_ASYNC_PATHS.iter())
            {
                let request = Request::head(*path).body(Body::empty())?;
                let (status, _) = send(router, request).await?;

                assert_eq!(StatusCode::OK, status, "HEAD {path}");
            }

            Ok(())
        }

        probe_all(&router).await?;
        assert_eq!(Phase::Idle, server.session().phase());

        // While an upload's body is still arriving
        let (sender, receiver) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(4);
        let slow_body = Body::from_stream(ReceiverStream::new(receiver));
        let upload = tokio::spawn({
            let router = router.clone();
            async move { send(&router, post(imgsink::UPLOAD_PATHS[0], slow_body)).await }
        });

        sender.send(Ok(Bytes::from_static(b"in flight"))).await?;
        wait_for_phase(&server.session(), Phase::Uploading).await?;

        probe_all(&router).await?;
        assert_eq!(Phase::Uploading, server.session().phase());

        drop(sender);
        let (status, _) = upload.await??;
        assert_eq!(StatusCode::OK, status);

        // And once it's done
        let done = Phase::Done {
            preallocation_applied: false,
        };
        assert_eq!(done, server.session().phase());

        probe_all(&router).await?;
        assert_eq!(done, server.session().phase());
        assert_eq!(b"in flight".to_vec(), fixture.destination_contents()?);

        Ok(())
    })
}

#[test]
fn other_methods_are_not_found() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;
        let router = server.router();

        for (method, path) in [
            (Method::GET, imgsink::UPLOAD_PATHS[0]),
            (Method::PUT, imgsink::UPLOAD_ARCHIVE_PATHS[1]),
            (Method::GET, imgsink::UPLOAD_ASYNC_PATHS[1]),
            (Method::HEAD, imgsink::UPLOAD_FORM_PATHS[0]),
        ] {
            let request = Request::builder()
                .method(method.clone())
                .uri(path)
                .body(Body::empty())?;
            let (status, _) = send(&router, request).await?;

            assert_eq!(StatusCode::NOT_FOUND, status, "{method} {path}");
        }

        assert_eq!(Phase::Idle, server.session().phase());

        Ok(())
    })
}

/// A plain upload lands byte for byte in the destination, and nothing else is admitted afterwards
#[test]
fn sync_upload_is_accepted_once() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;
        let router = server.router();

        let image = random_image(300_000);
        let (status, _) = send(&router, post(imgsink::UPLOAD_PATHS[1], image.clone())).await?;

        assert_eq!(StatusCode::OK, status);
        assert_eq!(image, fixture.destination_contents()?);
        assert_eq!(
            Phase::Done {
                preallocation_applied: false
            },
            server.session().phase()
        );

        for path in [imgsink::UPLOAD_PATHS[0], imgsink::UPLOAD_ASYNC_PATHS[0]] {
            let (status, _) = send(&router, post(path, b"again".to_vec())).await?;
            assert_eq!(StatusCode::CONFLICT, status, "{path}");
        }
        assert_eq!(image, fixture.destination_contents()?);

        Ok(())
    })
}

/// While one upload's body is still arriving, any other upload is turned away
#[test]
fn concurrent_upload_is_refused() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;
        let router = server.router();

        let (sender, receiver) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(4);
        let slow_body = Body::from_stream(ReceiverStream::new(receiver));

        let first = tokio::spawn({
            let router = router.clone();
            async move { send(&router, post(imgsink::UPLOAD_PATHS[0], slow_body)).await }
        });

        sender.send(Ok(Bytes::from_static(b"first half, "))).await?;
        wait_for_phase(&server.session(), Phase::Uploading).await?;

        let (status, _) = send(&router, post(imgsink::UPLOAD_PATHS[1], b"intruder".to_vec())).await?;
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, status);

        let (status, _) = send(
            &router,
            form_post(imgsink::UPLOAD_FORM_ASYNC_PATHS[0], &[("file", &b"intruder"[..])]),
        )
        .await?;
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, status);

        sender.send(Ok(Bytes::from_static(b"second half"))).await?;
        drop(sender);

        let (status, _) = first.await??;
        assert_eq!(StatusCode::OK, status);
        assert_eq!(
            b"first half, second half".to_vec(),
            fixture.destination_contents()?
        );

        Ok(())
    })
}

#[test]
fn archive_upload_unpacks_into_volume() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;

        let config_file = TestEntry::random_file("etc/app.conf", 2048);
        let archive = TarBuilder::new()
            .entry(TestEntry::dir("etc"))
            .entry(config_file.clone())
            .entry(TestEntry::file("README", b"hello".to_vec()))
            .build();

        let (status, _) = send(
            &server.router(),
            post(imgsink::UPLOAD_ARCHIVE_PATHS[0], archive),
        )
        .await?;

        assert_eq!(StatusCode::OK, status);
        assert_eq!(
            config_file.data,
            std::fs::read(fixture.volume.path().join("etc/app.conf"))?
        );
        assert_eq!(
            b"hello".to_vec(),
            std::fs::read(fixture.volume.path().join("README"))?
        );

        Ok(())
    })
}

#[test]
fn block_device_clone_is_decompressed() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;

        let image = random_image(200_000);
        let request = post_typed(
            imgsink::UPLOAD_PATHS[0],
            SourceContentType::BLOCK_DEVICE_CLONE,
            snappy_compress(&image),
        );
        let (status, _) = send(&server.router(), request).await?;

        assert_eq!(StatusCode::OK, status);
        assert_eq!(image, fixture.destination_contents()?);

        Ok(())
    })
}

/// Garbage where a snappy stream was announced is the client's fault, and fails the session
#[test]
fn corrupt_clone_stream_is_a_client_error() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;

        let request = post_typed(
            imgsink::UPLOAD_PATHS[0],
            SourceContentType::BLOCK_DEVICE_CLONE,
            b"definitely not snappy".to_vec(),
        );
        let (status, body) = send(&server.router(), request).await?;

        assert_eq!(StatusCode::BAD_REQUEST, status, "{body}");
        assert!(body.starts_with("Saving stream failed: "), "{body}");
        assert_eq!(Phase::Failed, server.session().phase());

        Ok(())
    })
}

/// The same holds for a filesystem clone, even though the tar reader is what trips over it
#[test]
fn corrupt_filesystem_clone_is_a_client_error() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;

        let request = post_typed(
            imgsink::UPLOAD_PATHS[0],
            SourceContentType::FILESYSTEM_CLONE,
            b"definitely not a snappy framed stream at all".to_vec(),
        );
        let (status, body) = send(&server.router(), request).await?;

        assert_eq!(StatusCode::BAD_REQUEST, status, "{body}");
        assert!(body.contains("The compressed upload stream is corrupt"), "{body}");
        assert_eq!(Phase::Failed, server.session().phase());

        Ok(())
    })
}

#[test]
fn filesystem_clone_unpacks_into_volume() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;

        let disk = TestEntry::random_file("disk.img", 40_000);
        let archive = TarBuilder::new()
            .entry(TestEntry::file("disk.img.json", b"{}".to_vec()))
            .entry(disk.clone())
            .build();

        let request = post_typed(
            imgsink::UPLOAD_PATHS[1],
            SourceContentType::FILESYSTEM_CLONE,
            snappy_compress(&archive),
        );
        let (status, _) = send(&server.router(), request).await?;

        assert_eq!(StatusCode::OK, status);
        assert_eq!(disk.data, fixture.destination_contents()?);
        assert_eq!(
            b"{}".to_vec(),
            std::fs::read(fixture.volume.path().join("disk.img.json"))?
        );

        Ok(())
    })
}

/// Filesystem clones can't be paused, so the async paths refuse them without spending the session
#[test]
fn async_filesystem_clone_is_refused() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;
        let router = server.router();

        let request = post_typed(
            imgsink::UPLOAD_ASYNC_PATHS[0],
            SourceContentType::FILESYSTEM_CLONE,
            snappy_compress(b"irrelevant"),
        );
        let (status, body) = send(&router, request).await?;

        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert!(body.contains("Async filesystem clone is not supported"), "{body}");
        assert_eq!(Phase::Idle, server.session().phase());

        let (status, _) = send(&router, post(imgsink::UPLOAD_PATHS[0], b"image".to_vec())).await?;
        assert_eq!(StatusCode::OK, status);

        Ok(())
    })
}

#[test]
fn form_upload_writes_file_part() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;

        let image = random_image(500_000);
        let request = form_post(
            imgsink::UPLOAD_FORM_PATHS[1],
            &[("comment", &b"ignored"[..]), ("file", &image[..])],
        );
        let (status, _) = send(&server.router(), request).await?;

        assert_eq!(StatusCode::OK, status);
        assert_eq!(image, fixture.destination_contents()?);

        Ok(())
    })
}

/// Form uploads aren't held to any body size limit of the HTTP stack
#[test]
fn large_form_uploads_are_accepted() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let image = random_image(3 << 20);

        let fixture = Fixture::new()?;
        let server = fixture.server()?;
        let request = form_post(imgsink::UPLOAD_FORM_PATHS[0], &[("file", &image[..])]);
        let (status, body) = send(&server.router(), request).await?;

        assert_eq!(StatusCode::OK, status, "{body}");
        assert_eq!(image, fixture.destination_contents()?);

        let fixture = Fixture::new()?;
        let server = fixture.server()?;
        let request = form_post(imgsink::UPLOAD_FORM_ASYNC_PATHS[0], &[("file", &image[..])]);
        let (status, body) = send(&server.router(), request).await?;

        assert_eq!(StatusCode::OK, status, "{body}");
        wait_for_phase(
            &server.session(),
            Phase::Done {
                preallocation_applied: false,
            },
        )
        .await?;
        assert_eq!(image, fixture.destination_contents()?);

        Ok(())
    })
}

/// A form without the `file` part never reached the destination, so the client may try again
#[test]
fn form_without_file_part_can_be_retried() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;
        let router = server.router();

        let request = form_post(imgsink::UPLOAD_FORM_PATHS[0], &[("image", &b"wrong name"[..])]);
        let (status, body) = send(&router, request).await?;

        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert!(body.contains("no part named 'file'"), "{body}");
        assert_eq!(Phase::Idle, server.session().phase());

        let request = post(imgsink::UPLOAD_FORM_PATHS[0], b"not multipart at all".to_vec());
        let (status, _) = send(&router, request).await?;

        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_eq!(Phase::Idle, server.session().phase());

        let request = form_post(imgsink::UPLOAD_FORM_PATHS[0], &[("file", &b"finally"[..])]);
        let (status, _) = send(&router, request).await?;

        assert_eq!(StatusCode::OK, status);
        assert_eq!(b"finally".to_vec(), fixture.destination_contents()?);

        Ok(())
    })
}

#[test]
fn oversized_upload_is_rejected() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let mut fixture = Fixture::new()?;
        fixture.config.image_size = Some("1000".to_string());
        fixture.config.filesystem_overhead = 0.5;
        let server = fixture.server()?;
        let router = server.router();

        let (status, body) = send(&router, post(imgsink::UPLOAD_PATHS[0], random_image(501))).await?;

        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert!(body.starts_with("Saving stream failed: "), "{body}");
        assert_eq!(Phase::Failed, server.session().phase());

        let (status, _) = send(&router, post(imgsink::UPLOAD_PATHS[0], random_image(10))).await?;
        assert_eq!(StatusCode::CONFLICT, status);

        Ok(())
    })
}

#[test]
fn async_oversized_upload_is_rejected_before_response() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let mut fixture = Fixture::new()?;
        fixture.config.image_size = Some("1000".to_string());
        let server = fixture.server()?;

        let (status, _) = send(
            &server.router(),
            post(imgsink::UPLOAD_ASYNC_PATHS[1], random_image(1001)),
        )
        .await?;

        assert_eq!(StatusCode::BAD_REQUEST, status);
        assert_eq!(Phase::Failed, server.session().phase());
        assert!(!fixture.config.destination.exists());

        Ok(())
    })
}

#[test]
fn preallocation_is_reported() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let mut fixture = Fixture::new()?;
        fixture.config.image_size = Some("4096".to_string());
        fixture.config.preallocation = true;
        let server = fixture.server()?;

        let (status, _) = send(
            &server.router(),
            post(imgsink::UPLOAD_PATHS[0], b"small".to_vec()),
        )
        .await?;

        assert_eq!(StatusCode::OK, status);
        assert!(server.session().preallocation_applied());
        assert_eq!(4096, std::fs::metadata(&fixture.config.destination)?.len());

        Ok(())
    })
}

/// The async path answers once the body is validated, and finishes writing in the background
#[test]
fn async_upload_finishes_in_background() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;
        let router = server.router();

        let image = random_image(250_000);
        let (status, _) = send(&router, post(imgsink::UPLOAD_ASYNC_PATHS[0], image.clone())).await?;
        assert_eq!(StatusCode::OK, status);

        wait_for_phase(
            &server.session(),
            Phase::Done {
                preallocation_applied: false,
            },
        )
        .await?;
        assert_eq!(image, fixture.destination_contents()?);

        let (status, _) = send(&router, post(imgsink::UPLOAD_ASYNC_PATHS[0], image)).await?;
        assert_eq!(StatusCode::CONFLICT, status);

        Ok(())
    })
}

#[test]
fn async_form_upload_finishes_in_background() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server()?;

        let image = random_image(100_000);
        let request = form_post(imgsink::UPLOAD_FORM_ASYNC_PATHS[1], &[("file", &image[..])]);
        let (status, _) = send(&server.router(), request).await?;
        assert_eq!(StatusCode::OK, status);

        wait_for_phase(
            &server.session(),
            Phase::Done {
                preallocation_applied: false,
            },
        )
        .await?;
        assert_eq!(image, fixture.destination_contents()?);

        Ok(())
    })
}

#[test]
fn processing_failure_is_terminal() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server_with(Arc::new(FailingFactory { on_resume: false }))?;
        let router = server.router();

        let (status, body) = send(&router, post(imgsink::UPLOAD_PATHS[0], random_image(100))).await?;

        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, status);
        assert_eq!(
            "Saving stream failed: The data processor failed: disk on fire",
            body
        );
        assert_eq!(Phase::Failed, server.session().phase());

        let (status, _) = send(&router, post(imgsink::UPLOAD_PATHS[0], random_image(100))).await?;
        assert_eq!(StatusCode::CONFLICT, status);

        Ok(())
    })
}

/// A failure after the client was already answered can only fail the session, never complete it
#[test]
fn background_failure_fails_session() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let fixture = Fixture::new()?;
        let server = fixture.server_with(Arc::new(FailingFactory { on_resume: true }))?;

        let (status, _) = send(
            &server.router(),
            post(imgsink::UPLOAD_ASYNC_PATHS[1], random_image(100)),
        )
        .await?;
        assert_eq!(StatusCode::OK, status);

        wait_for_phase(&server.session(), Phase::Failed).await?;
        assert!(!server.session().preallocation_applied());

        Ok(())
    })
}

/// The client certificate check comes before the phase check, and a rejected peer doesn't use up
/// the session
#[test]
fn client_common_name_is_enforced() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let mut fixture = Fixture::new()?;
        fixture.config.client_name = Some("client-A".to_string());
        let server = fixture.server()?;
        let router = server.router();

        let tagged = |names: &[&str], body: &'static [u8]| {
            let mut request = post(imgsink::UPLOAD_PATHS[0], body);
            request.extensions_mut().insert(PeerIdentity::Tls {
                common_names: names.iter().map(ToString::to_string).collect(),
            });
            request
        };

        let (status, _) = send(&router, tagged(&["client-B"], b"rejected")).await?;
        assert_eq!(StatusCode::UNAUTHORIZED, status);

        let (status, _) = send(&router, tagged(&[], b"rejected")).await?;
        assert_eq!(StatusCode::UNAUTHORIZED, status);
        assert_eq!(Phase::Idle, server.session().phase());

        let (status, _) = send(&router, tagged(&["client-B", "client-A"], b"accepted")).await?;
        assert_eq!(StatusCode::OK, status);
        assert_eq!(b"accepted".to_vec(), fixture.destination_contents()?);

        // Even now that the session is done, the wrong peer is told it's unauthorized
        let (status, _) = send(&router, tagged(&["client-B"], b"rejected")).await?;
        assert_eq!(StatusCode::UNAUTHORIZED, status);

        Ok(())
    })
}

#[test]
fn health_router_answers_ok() -> Result<()> {
    imgsink_testing::logging::test_with_logging(async move {
        let request = Request::get(imgsink::HEALTHZ_PATH).body(Body::empty())?;
        let (status, body) = send(&imgsink::health_router(), request).await?;

        assert_eq!(StatusCode::OK, status);
        assert_eq!("OK", body);

        Ok(())
    })
}
