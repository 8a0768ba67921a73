// Tests for the parsing support: the MPD model, the runtime presentation built from it, and the
// period selection rule.

pub mod common;

use common::setup_logging;
use dash_demux::presentation::{MediaKind, Presentation, SegmentIndex, select_period};
use dash_demux::{parse, DashDemuxError, DemuxOptions};
use pretty_assertions::assert_eq;
use url::Url;


fn doc_url() -> Url {
    Url::parse("https://example.net/media/stream.mpd").unwrap()
}

fn build(xml: &str, curr_timepoint: i64) -> Result<Presentation, DashDemuxError> {
    Presentation::from_xml(xml, &doc_url(), curr_timepoint, 0, &DemuxOptions::default(), 0)
}


#[test]
fn test_mpd_parser() {
    setup_logging();
    let case1 = r#"<?xml version="1.0" encoding="UTF-8"?><MPD><Period></Period></MPD>"#;
    let res = parse(case1);
    assert!(res.is_ok());
    let mpd = res.unwrap();
    assert_eq!(mpd.periods.len(), 1);
    assert!(mpd.ProgramInformation.is_none());

    let case2 = r#"<?xml version="1.0" encoding="UTF-8"?><MPD foo="foo"><Period></Period><foo></foo></MPD>"#;
    let res = parse(case2);
    assert!(res.is_ok());
    let mpd = res.unwrap();
    assert_eq!(mpd.periods.len(), 1);

    let case3 = r#"<?xml version="1.0" encoding="UTF-8"?><MPD><Period></PeriodZ></MPD>"#;
    let res = parse(case3);
    assert!(res.is_err());
}

#[test]
fn test_vod_presentation_model() {
    setup_logging();
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD type="static" mediaPresentationDuration="PT20S" minBufferTime="PT2S"
     profiles="urn:mpeg:dash:profile:isoff-live:2011">
  <Period>
    <AdaptationSet contentType="video" frameRate="25">
      <SegmentTemplate media="video/$RepresentationID$/seg-$Number$.m4s"
                       initialization="video/$RepresentationID$/init.mp4"
                       duration="2" timescale="1" startNumber="1"/>
      <Representation id="v720" bandwidth="2000000" codecs="avc1.64001f" width="1280" height="720"/>
      <Representation id="v360" bandwidth="700000" codecs="avc1.64001e" width="640" height="360"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" lang="fr">
      <SegmentTemplate media="audio/seg-$Number$.m4s" initialization="audio/init.mp4"
                       duration="2" timescale="1" startNumber="1"/>
      <Representation id="a1" bandwidth="128000" codecs="mp4a.40.2"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let pres = build(xml, 0).unwrap();
    assert!(!pres.is_live);
    assert_eq!(pres.media_presentation_duration, 20);
    assert_eq!(pres.min_buffer_time, 2);
    assert_eq!(pres.videos.len(), 2);
    assert_eq!(pres.audios.len(), 1);
    assert_eq!(pres.subtitles.len(), 0);

    let v = &pres.videos[0];
    assert_eq!(v.id, "v720");
    assert_eq!(v.kind, MediaKind::Video);
    assert_eq!(v.bandwidth, 2_000_000);
    assert_eq!(v.codecs.as_deref(), Some("avc1.64001f"));
    assert_eq!(v.frame_rate.as_deref(), Some("25"));
    assert_eq!((v.width, v.height), (Some(1280), Some(720)));
    assert_eq!(v.first_seq_no, 1);
    assert_eq!(v.last_seq_no, 10);
    assert_eq!(v.cur_seq_no, 1);
    assert!(matches!(v.index, SegmentIndex::TemplateDuration { .. }));
    let init = v.init_section.as_ref().unwrap();
    assert_eq!(init.url.as_str(), "https://example.net/media/video/v720/init.mp4");
    assert_eq!(init.size, -1);

    let a = &pres.audios[0];
    assert_eq!(a.lang.as_deref(), Some("fr"));
    assert_eq!(a.kind, MediaKind::Audio);
}

#[test]
fn test_live_attributes() {
    setup_logging();
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD type="dynamic" availabilityStartTime="1970-01-01T00:16:40Z"
     publishTime="1970-01-01T01:00:00Z" minimumUpdatePeriod="PT5S"
     timeShiftBufferDepth="PT1M" suggestedPresentationDelay="PT10S" minBufferTime="PT4S">
  <Period start="PT0S">
    <AdaptationSet contentType="video">
      <SegmentTemplate media="seg-$Number$.m4s" duration="2" timescale="1" startNumber="1"/>
      <Representation id="v1" bandwidth="1000000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let pres = Presentation::from_xml(
        xml, &doc_url(), 0, 0, &DemuxOptions::default(), 2000).unwrap();
    assert!(pres.is_live);
    assert_eq!(pres.availability_start_time, 1000);
    assert_eq!(pres.publish_time, 3600);
    assert_eq!(pres.minimum_update_period, 5);
    assert_eq!(pres.time_shift_buffer_depth, 60);
    assert_eq!(pres.suggested_presentation_delay, 10);
    assert_eq!(pres.min_buffer_time, 4);
    // live edge at t=2000: (2000 - 1000 - 10) / 2 segments after the first
    assert_eq!(pres.videos[0].cur_seq_no, 1 + 495);
}

#[test]
fn test_period_selection() {
    setup_logging();
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD type="static" mediaPresentationDuration="PT100S">
  <Period id="one" start="PT0S" duration="PT30S">
    <AdaptationSet contentType="video">
      <SegmentTemplate media="p1/seg-$Number$.m4s" duration="2" timescale="1"/>
      <Representation id="v1" bandwidth="1000"/>
    </AdaptationSet>
  </Period>
  <Period id="two" start="PT30S" duration="PT70S">
    <AdaptationSet contentType="video">
      <SegmentTemplate media="p2/seg-$Number$.m4s" duration="2" timescale="1"/>
      <Representation id="v1" bandwidth="1000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let mpd = parse(xml).unwrap();
    let (p, start, default) = select_period(&mpd, 0, 0).unwrap();
    assert_eq!(p.id.as_deref(), Some("one"));
    assert_eq!(start, 0);
    assert!(!default);
    let (p, start, _) = select_period(&mpd, 29, 0).unwrap();
    assert_eq!(p.id.as_deref(), Some("one"));
    assert_eq!(start, 0);
    let (p, start, _) = select_period(&mpd, 30, 0).unwrap();
    assert_eq!(p.id.as_deref(), Some("two"));
    assert_eq!(start, 30);

    // the runtime model binds representations to the selected period
    let pres = build(xml, 45).unwrap();
    assert_eq!(pres.period_start, 30);
    assert_eq!(pres.period_duration, 70);
    let frag_base = match &pres.videos[0].index {
        SegmentIndex::TemplateDuration { media } => media.clone(),
        other => panic!("unexpected index style {other:?}"),
    };
    assert_eq!(frag_base, "p2/seg-$Number$.m4s");
}

#[test]
fn test_period_selection_default_rewrites_duration() {
    setup_logging();
    // No period covers the requested timepoint, so the latest period at or after the remembered
    // start is chosen, and the presentation duration is coupled to that period's duration.
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD type="static" mediaPresentationDuration="PT100S">
  <Period id="late" start="PT40S" duration="PT60S">
    <AdaptationSet contentType="video">
      <SegmentTemplate media="seg-$Number$.m4s" duration="2" timescale="1"/>
      <Representation id="v1" bandwidth="1000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let mpd = parse(xml).unwrap();
    let (p, start, default) = select_period(&mpd, 10, 0).unwrap();
    assert_eq!(p.id.as_deref(), Some("late"));
    assert_eq!(start, 40);
    assert!(default);
    let pres = build(xml, 10).unwrap();
    assert_eq!(pres.media_presentation_duration, 60);

    // nothing at or after the remembered period start: the manifest is unusable
    let err = Presentation::from_xml(
        xml, &doc_url(), 10, 50, &DemuxOptions::default(), 0);
    assert!(matches!(err, Err(DashDemuxError::InvalidManifest(_))));
}

#[test]
fn test_segment_list() {
    setup_logging();
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD type="static" mediaPresentationDuration="PT4S">
  <Period>
    <AdaptationSet contentType="audio">
      <Representation id="a1" bandwidth="64000">
        <BaseURL>all-in-one.mp4</BaseURL>
        <SegmentList duration="2" timescale="1" startNumber="1">
          <Initialization sourceURL="all-in-one.mp4" range="0-99"/>
          <SegmentURL mediaRange="100-499"/>
          <SegmentURL mediaRange="500-999"/>
        </SegmentList>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let pres = build(xml, 0).unwrap();
    let a = &pres.audios[0];
    let SegmentIndex::List(frags) = &a.index else {
        panic!("expected an explicit fragment list");
    };
    assert_eq!(frags.len(), 2);
    assert_eq!(frags[0].url.as_str(), "https://example.net/media/all-in-one.mp4");
    assert_eq!((frags[0].url_offset, frags[0].size), (100, 400));
    assert_eq!((frags[1].url_offset, frags[1].size), (500, 500));
    let init = a.init_section.as_ref().unwrap();
    assert_eq!((init.url_offset, init.size), (0, 100));
    assert_eq!(a.first_seq_no, 1);
    assert_eq!(a.last_seq_no, 2);
}

#[test]
fn test_last_segment_number_property() {
    setup_logging();
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD type="static" mediaPresentationDuration="PT20S">
  <Period>
    <AdaptationSet contentType="video">
      <SupplementalProperty schemeIdUri="http://dashif.org/guidelines/last-segment-number" value="7"/>
      <SegmentTemplate media="seg-$Number$.m4s" duration="2" timescale="1" startNumber="1"/>
      <Representation id="v1" bandwidth="1000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let pres = build(xml, 0).unwrap();
    assert_eq!(pres.videos[0].last_seq_no, 7);
}

#[test]
fn test_manifest_without_periods_rejected() {
    setup_logging();
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?><MPD type="static"></MPD>"#;
    assert!(matches!(build(xml, 0), Err(DashDemuxError::InvalidManifest(_))));
}

#[test]
fn test_base_url_cascade() {
    setup_logging();
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD type="static" mediaPresentationDuration="PT4S">
  <BaseURL>https://cdn.example.com/content/</BaseURL>
  <Period>
    <BaseURL>show/</BaseURL>
    <AdaptationSet contentType="video">
      <BaseURL>video/</BaseURL>
      <SegmentTemplate media="seg-$Number$.m4s" duration="2" timescale="1"/>
      <Representation id="v1" bandwidth="1000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let pres = build(xml, 0).unwrap();
    assert_eq!(pres.base_url.as_str(), "https://cdn.example.com/content/show/");
    assert_eq!(pres.videos[0].base_url.as_str(), "https://cdn.example.com/content/show/video/");
}
